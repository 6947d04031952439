use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::{Buf, BufMut};
use tokio::time::Instant;
use tracing::{debug, warn};
use crate::category::ThrottleCategory;
use crate::rate_limiter::TokenBucket;

/// Byte rates (bytes per second) for the seven throttled categories, indexed by category.
#[derive(Clone, Copy, Eq, PartialEq, Default)]
pub struct ThrottleRates(pub [u64; ThrottleCategory::COUNT]);

impl ThrottleRates {
    /// length of the packed representation: one f32 per category
    pub const PACKED_LEN: usize = ThrottleCategory::COUNT * 4;

    pub fn new(resend: u64, land: u64, wind: u64, cloud: u64, task: u64, texture: u64, asset: u64) -> ThrottleRates {
        ThrottleRates([resend, land, wind, cloud, task, texture, asset])
    }

    pub fn get(&self, category: ThrottleCategory) -> u64 {
        self.0.get(category.index()).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Parses the packed wire format: 7 little-endian f32 values in bits per second, in category
    ///  order. Negative and non-finite values are mapped to 0, i.e. to the category floor once
    ///  applied.
    pub fn deser_packed(buf: &mut impl Buf) -> anyhow::Result<ThrottleRates> {
        if buf.remaining() < Self::PACKED_LEN {
            bail!("packed throttles need {} bytes, got {}", Self::PACKED_LEN, buf.remaining());
        }

        let mut rates = [0u64; ThrottleCategory::COUNT];
        for rate in rates.iter_mut() {
            let bits_per_second = buf.get_f32_le();
            *rate = if bits_per_second.is_finite() && bits_per_second > 0.0 {
                (bits_per_second as f64 / 8.0) as u64
            }
            else {
                0
            };
        }
        Ok(ThrottleRates(rates))
    }

    /// Writes the packed wire format, converting bytes to bits and applying `multiplier`
    pub fn ser_packed(&self, multiplier: f32, buf: &mut impl BufMut) {
        for &rate in &self.0 {
            buf.put_f32_le((rate as f64 * 8.0 * multiplier as f64) as f32);
        }
    }
}

impl Debug for ThrottleRates {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "THRTL{{")?;
        for (i, category) in ThrottleCategory::ALL.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", category, self.0[i])?;
        }
        write!(f, "}}")
    }
}

/// the outcome of a rate renegotiation
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RateAdjustment {
    pub requested: ThrottleRates,
    pub applied: ThrottleRates,
    /// true if the requested rates had to be scaled down to honor the connection maximum
    pub scaled: bool,
}

/// Clamps requested rates to the category floors and `max_total`, then scales them down
///  proportionally if their sum exceeds `max_total`. The result never undercuts a floor and
///  never sums to more than `max_total`, provided the floors themselves fit (which
///  configuration validation ensures).
pub fn negotiate_rates(requested: ThrottleRates, max_total: u64) -> (ThrottleRates, bool) {
    let floors = ThrottleCategory::ALL.map(|c| c.rate_floor());

    let mut clamped = [0u64; ThrottleCategory::COUNT];
    for i in 0..ThrottleCategory::COUNT {
        let r = if requested.0[i] == 0 { floors[i] } else { requested.0[i] };
        clamped[i] = r.clamp(floors[i], max_total.max(floors[i]));
    }

    let sum: u64 = clamped.iter().sum();
    if sum <= max_total {
        return (ThrottleRates(clamped), false);
    }

    // uniform scaling
    let mut scaled = clamped.map(|r| ((r as u128 * max_total as u128) / sum as u128) as u64);
    if scaled.iter().zip(floors.iter()).any(|(r, f)| r < f) {
        // uniform scaling would undercut a floor: scale only the part above the floors
        let floor_sum: u64 = floors.iter().sum();
        let above_sum = sum - floor_sum;
        let available = max_total.saturating_sub(floor_sum);
        for i in 0..ThrottleCategory::COUNT {
            let above = clamped[i] - floors[i];
            scaled[i] = floors[i] + ((above as u128 * available as u128) / above_sum.max(1) as u128) as u64;
        }
    }

    // integer division leaves a remainder; hand it out to the largest categories so the sum is
    //  exactly the maximum
    let mut remainder = max_total.saturating_sub(scaled.iter().sum());
    let mut order: Vec<usize> = (0..ThrottleCategory::COUNT).collect();
    order.sort_by(|&a, &b| scaled[b].cmp(&scaled[a]));
    for &i in order.iter().cycle().take(ThrottleCategory::COUNT * 2) {
        if remainder == 0 {
            break;
        }
        scaled[i] += 1;
        remainder -= 1;
    }

    (ThrottleRates(scaled), true)
}

/// burst capacity for a given rate: `rate * burst_time`, but at least one full packet
pub fn burst_for_rate(rate: u64, burst_time: Duration, mtu: usize) -> u64 {
    ((rate as f64 * burst_time.as_secs_f64()) as u64).max(mtu as u64)
}

/// A connection's subtree in the rate limiter hierarchy: one node for the connection's total
///  allowance (a child of the server-wide root) and one child node per category.
pub struct ConnectionThrottles {
    total: Arc<TokenBucket>,
    categories: [Arc<TokenBucket>; ThrottleCategory::COUNT],
    max_total: u64,
    burst_time: Duration,
    mtu: usize,
}

impl ConnectionThrottles {
    pub fn new(
        root: &Arc<TokenBucket>,
        max_total: u64,
        initial: ThrottleRates,
        burst_time: Duration,
        mtu: usize,
    ) -> ConnectionThrottles {
        let (rates, scaled) = negotiate_rates(initial, max_total);
        if scaled {
            debug!("initial throttle rates {:?} exceed the connection maximum of {} - scaled to {:?}", initial, max_total, rates);
        }

        let total = TokenBucket::new_child(root, max_total, burst_for_rate(max_total, burst_time, mtu));
        let categories = ThrottleCategory::ALL.map(|c| {
            let rate = rates.get(c);
            TokenBucket::new_child(&total, rate, burst_for_rate(rate, burst_time, mtu))
        });

        ConnectionThrottles {
            total,
            categories,
            max_total,
            burst_time,
            mtu,
        }
    }

    pub fn max_total(&self) -> u64 {
        self.max_total
    }

    pub fn total_bucket(&self) -> &Arc<TokenBucket> {
        &self.total
    }

    /// The bucket for a throttled category, `None` for [ThrottleCategory::Unknown]
    pub fn bucket(&self, category: ThrottleCategory) -> Option<&Arc<TokenBucket>> {
        self.categories.get(category.index())
    }

    pub fn rates(&self) -> ThrottleRates {
        ThrottleRates(self.categories.each_ref().map(|b| b.drip_rate()))
    }

    /// renegotiates all category rates, see [negotiate_rates]
    pub fn set_rates(&self, requested: ThrottleRates, now: Instant) -> RateAdjustment {
        let (applied, scaled) = negotiate_rates(requested, self.max_total);
        if scaled {
            warn!("requested throttles {:?} (sum {}) exceed the connection maximum of {} - scaled down to {:?}",
                requested, requested.total(), self.max_total, applied);
        }

        for category in ThrottleCategory::ALL {
            let rate = applied.get(category);
            self.categories[category.index()].set_rate(rate, burst_for_rate(rate, self.burst_time, self.mtu), now);
        }

        RateAdjustment {
            requested,
            applied,
            scaled,
        }
    }

    /// withdraws `num_bytes` from the category's bucket (and thereby from the connection's and the
    ///  server's allowance). Unthrottled traffic always passes.
    pub fn try_consume(&self, category: ThrottleCategory, num_bytes: usize, now: Instant) -> bool {
        match self.bucket(category) {
            Some(bucket) => bucket.try_remove_at(num_bytes, now),
            None => true,
        }
    }

    /// detaches the whole subtree so the server-wide root no longer accounts for it
    pub fn detach(&self) {
        for bucket in &self.categories {
            bucket.detach();
        }
        self.total.detach();
    }
}
