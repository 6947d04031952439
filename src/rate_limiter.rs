//! Hierarchical token buckets.
//!
//! Every bucket accumulates tokens (bytes of send allowance) at its drip rate, up to its burst
//!  capacity. Refilling is lazy: it is computed from the time elapsed since the previous request
//!  rather than by a timer. A bucket with a parent may only spend what all its ancestors can
//!  supply as well, which allows a server-wide cap to be subdivided per connection and, inside a
//!  connection, per traffic category.
//!
//! Locking is per bucket and always proceeds from child to parent, so concurrent withdrawals
//!  from sibling subtrees contend only on the shared ancestors, and only briefly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct BucketState {
    /// bytes per second; 0 means 'unlimited'
    drip_rate: u64,
    burst: u64,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.drip_rate as f64).min(self.burst as f64);
        self.last_refill = now;
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    parent: Option<Arc<TokenBucket>>,
    state: Mutex<BucketState>,
    /// sum of the drip rates of all attached child buckets
    committed_child_rate: AtomicU64,
    attached: AtomicBool,
}

impl TokenBucket {
    /// Creates a bucket without a parent. A `drip_rate` of 0 creates an unlimited bucket.
    pub fn new_root(drip_rate: u64, burst: u64) -> Arc<TokenBucket> {
        Arc::new(Self::new(None, drip_rate, burst))
    }

    /// Creates a bucket drawing from `parent`, registering its rate with the parent. The bucket
    ///  starts out full.
    pub fn new_child(parent: &Arc<TokenBucket>, drip_rate: u64, burst: u64) -> Arc<TokenBucket> {
        parent.committed_child_rate.fetch_add(drip_rate, Ordering::AcqRel);
        Arc::new(Self::new(Some(parent.clone()), drip_rate, burst))
    }

    fn new(parent: Option<Arc<TokenBucket>>, drip_rate: u64, burst: u64) -> TokenBucket {
        TokenBucket {
            parent,
            state: Mutex::new(BucketState {
                drip_rate,
                burst,
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            committed_child_rate: AtomicU64::new(0),
            attached: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn drip_rate(&self) -> u64 {
        self.lock().drip_rate
    }

    pub fn burst(&self) -> u64 {
        self.lock().burst
    }

    pub fn committed_child_rate(&self) -> u64 {
        self.committed_child_rate.load(Ordering::Acquire)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// current token level after refilling up to `now`
    pub fn tokens_at(&self, now: Instant) -> f64 {
        let mut state = self.lock();
        if state.drip_rate == 0 {
            return f64::INFINITY;
        }
        state.refill(now);
        state.tokens
    }

    pub fn try_remove(&self, num_bytes: usize) -> bool {
        self.try_remove_at(num_bytes, Instant::now())
    }

    /// Removes `num_bytes` tokens from this bucket and all its ancestors if - and only if - every
    ///  one of them can supply them. Returns `false` without changing any token level otherwise.
    pub fn try_remove_at(&self, num_bytes: usize, now: Instant) -> bool {
        if !self.is_attached() {
            return false;
        }

        let mut state = self.lock();
        let unlimited = state.drip_rate == 0;
        if !unlimited {
            state.refill(now);
            if state.tokens < num_bytes as f64 {
                trace!("token bucket: {} bytes requested, {:.0} available", num_bytes, state.tokens);
                return false;
            }
        }

        if let Some(parent) = &self.parent {
            if !parent.try_remove_at(num_bytes, now) {
                return false;
            }
        }

        if !unlimited {
            state.tokens -= num_bytes as f64;
        }
        true
    }

    /// Changes drip rate and burst capacity, keeping the parent's bookkeeping of committed child
    ///  rates consistent. The current token level is clamped to the new burst.
    pub fn set_rate(&self, drip_rate: u64, burst: u64, now: Instant) {
        let mut state = self.lock();
        state.refill(now);

        if self.is_attached() {
            if let Some(parent) = &self.parent {
                parent.committed_child_rate.fetch_add(drip_rate, Ordering::AcqRel);
                parent.committed_child_rate.fetch_sub(state.drip_rate, Ordering::AcqRel);
            }
        }

        state.drip_rate = drip_rate;
        state.burst = burst;
        state.tokens = state.tokens.min(burst as f64);
    }

    /// Detaches this bucket from its parent: its rate is no longer committed in the parent, and
    ///  all further withdrawals fail. Detaching twice has no effect.
    pub fn detach(&self) {
        if self.attached.swap(false, Ordering::AcqRel) {
            if let Some(parent) = &self.parent {
                parent.committed_child_rate.fetch_sub(self.drip_rate(), Ordering::AcqRel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case::enough(1000, 1000, 500, true, 500.0)]
    #[case::exact(1000, 1000, 1000, true, 0.0)]
    #[case::too_much(1000, 1000, 1001, false, 1000.0)]
    #[case::zero(1000, 1000, 0, true, 1000.0)]
    fn test_try_remove_full_bucket(#[case] rate: u64, #[case] burst: u64, #[case] requested: usize, #[case] expected: bool, #[case] expected_tokens: f64) {
        let now = Instant::now();
        let bucket = TokenBucket::new_root(rate, burst);

        assert_eq!(bucket.try_remove_at(requested, now), expected);
        assert_eq!(bucket.tokens_at(now), expected_tokens);
    }

    #[rstest]
    #[case::nothing_elapsed(0, 0.0)]
    #[case::half_second(500, 500.0)]
    #[case::one_second(1000, 1000.0)]
    #[case::capped_at_burst(5000, 2000.0)]
    fn test_lazy_refill(#[case] elapsed_millis: u64, #[case] expected_tokens: f64) {
        let bucket = TokenBucket::new_root(1000, 2000);
        let now = Instant::now();
        assert!(bucket.try_remove_at(2000, now));

        let later = now + Duration::from_millis(elapsed_millis);
        assert!((bucket.tokens_at(later) - expected_tokens).abs() < 0.001);
    }

    #[test]
    fn test_unlimited_root() {
        let bucket = TokenBucket::new_root(0, 0);
        assert!(bucket.try_remove_at(1_000_000, Instant::now()));
        assert!(bucket.try_remove_at(1_000_000, Instant::now()));
    }

    #[test]
    fn test_child_limited_by_parent() {
        let now = Instant::now();
        let parent = TokenBucket::new_root(100, 100);
        let child = TokenBucket::new_child(&parent, 1000, 1000);

        assert!(!child.try_remove_at(200, now));
        // a failed withdrawal leaves both levels untouched
        assert_eq!(child.tokens_at(now), 1000.0);
        assert_eq!(parent.tokens_at(now), 100.0);

        assert!(child.try_remove_at(100, now));
        assert_eq!(child.tokens_at(now), 900.0);
        assert_eq!(parent.tokens_at(now), 0.0);
    }

    #[test]
    fn test_siblings_share_parent() {
        let now = Instant::now();
        let parent = TokenBucket::new_root(1000, 1000);
        let a = TokenBucket::new_child(&parent, 1000, 1000);
        let b = TokenBucket::new_child(&parent, 1000, 1000);

        assert!(a.try_remove_at(600, now));
        assert!(!b.try_remove_at(600, now));
        assert!(b.try_remove_at(400, now));
    }

    #[test]
    fn test_committed_rate_bookkeeping() {
        let now = Instant::now();
        let parent = TokenBucket::new_root(0, 0);
        let a = TokenBucket::new_child(&parent, 300, 300);
        let b = TokenBucket::new_child(&parent, 200, 200);
        assert_eq!(parent.committed_child_rate(), 500);

        a.set_rate(100, 100, now);
        assert_eq!(parent.committed_child_rate(), 300);

        a.detach();
        assert_eq!(parent.committed_child_rate(), 200);
        a.detach();
        assert_eq!(parent.committed_child_rate(), 200);

        b.detach();
        assert_eq!(parent.committed_child_rate(), 0);
    }

    #[test]
    fn test_detached_bucket_refuses() {
        let parent = TokenBucket::new_root(0, 0);
        let child = TokenBucket::new_child(&parent, 1000, 1000);
        child.detach();

        assert!(!child.is_attached());
        assert!(!child.try_remove_at(1, Instant::now()));
    }

    #[test]
    fn test_set_rate_clamps_tokens() {
        let now = Instant::now();
        let bucket = TokenBucket::new_root(1000, 1000);
        bucket.set_rate(100, 100, now);

        assert_eq!(bucket.drip_rate(), 100);
        assert_eq!(bucket.burst(), 100);
        assert_eq!(bucket.tokens_at(now), 100.0);
    }
}
