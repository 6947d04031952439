//! Per-connection reliable delivery bookkeeping: reliable packets awaiting acknowledgement,
//!  inbound sequence numbers awaiting an ACK to the peer, recently seen inbound sequence numbers
//!  for duplicate suppression, and the RTT / RTO estimate.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::trace;
use crate::outgoing_packet::OutgoingPacket;

/// Smoothed RTT with a retransmission timeout of `5 * srtt`, clamped to `[min_rto, max_rto]`.
///  There is no variance term.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rto: Duration,
    alpha: f64,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub const RTO_FACTOR: u32 = 5;

    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration, alpha: f64) -> RttEstimator {
        RttEstimator {
            srtt: None,
            rto: initial_rto.clamp(min_rto, max_rto),
            alpha,
            min_rto,
            max_rto,
        }
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn on_sample(&mut self, rtt: Duration) {
        let srtt = match self.srtt {
            None => rtt,
            Some(prev) => {
                let nanos = prev.as_nanos() as f64 * (1.0 - self.alpha) + rtt.as_nanos() as f64 * self.alpha;
                Duration::from_nanos(nanos.round() as u64)
            }
        };
        self.srtt = Some(srtt);
        self.rto = (srtt * Self::RTO_FACTOR).clamp(self.min_rto, self.max_rto);
        trace!("RTT sample {:?}: srtt={:?}, rto={:?}", rtt, srtt, self.rto);
    }
}

/// Bounded set of recently accepted sequence numbers; the oldest entry is evicted when full
#[derive(Debug)]
pub struct SeenSequences {
    order: VecDeque<u32>,
    set: FxHashSet<u32>,
    capacity: usize,
}

impl SeenSequences {
    pub fn new(capacity: usize) -> SeenSequences {
        SeenSequences {
            order: VecDeque::with_capacity(capacity),
            set: FxHashSet::default(),
            capacity,
        }
    }

    /// Records `seq`. Returns `true` if it was already present, leaving the set unchanged.
    pub fn check_and_insert(&mut self, seq: u32) -> bool {
        if self.set.contains(&seq) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.order.push_back(seq);
        self.set.insert(seq);
        false
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug)]
struct UnackedPacket {
    packet: OutgoingPacket,
    /// a copy of the packet is queued for resending
    awaiting_resend: bool,
}

#[derive(Debug)]
pub struct ReliabilityTracker {
    need_ack: BTreeMap<u32, UnackedPacket>,
    pending_acks: VecDeque<u32>,
    seen: SeenSequences,
    rtt: RttEstimator,
    bytes_since_last_ack: usize,
}

impl ReliabilityTracker {
    pub fn new(rtt: RttEstimator, seen_capacity: usize) -> ReliabilityTracker {
        ReliabilityTracker {
            need_ack: BTreeMap::new(),
            pending_acks: VecDeque::new(),
            seen: SeenSequences::new(seen_capacity),
            rtt,
            bytes_since_last_ack: 0,
        }
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn on_rtt_sample(&mut self, rtt: Duration) {
        self.rtt.on_sample(rtt);
    }

    /// Starts tracking a reliable packet after its first transmission. The packet's sequence
    ///  number and send timestamp must be set.
    pub fn register_sent(&mut self, packet: OutgoingPacket) {
        trace!("tracking {:?} for acknowledgement", packet);
        self.need_ack.insert(packet.sequence, UnackedPacket {
            packet,
            awaiting_resend: false,
        });
    }

    /// Updates a tracked packet after it was resent. Returns `false` if the packet is no longer
    ///  tracked, i.e. it was acknowledged in the meantime.
    pub fn register_resent(&mut self, seq: u32, now: Instant) -> bool {
        match self.need_ack.get_mut(&seq) {
            Some(entry) => {
                entry.packet.retries += 1;
                entry.packet.last_send = Some(now);
                entry.awaiting_resend = false;
                true
            }
            None => false,
        }
    }

    pub fn is_unacked(&self, seq: u32) -> bool {
        self.need_ack.contains_key(&seq)
    }

    /// Stops tracking `seq`. RTT is sampled only for packets that were never resent, since an ACK
    ///  for a resent packet can not be attributed to a specific transmission. Returns `None` for an
    ///  unknown or already acknowledged sequence number.
    pub fn acknowledge(&mut self, seq: u32, now: Instant) -> Option<OutgoingPacket> {
        let entry = self.need_ack.remove(&seq)?;
        if entry.packet.retries == 0 {
            if let Some(sent) = entry.packet.last_send {
                self.rtt.on_sample(now.saturating_duration_since(sent));
            }
        }
        Some(entry.packet)
    }

    /// Stops tracking `seq` without an RTT sample
    pub fn remove(&mut self, seq: u32) -> Option<OutgoingPacket> {
        self.need_ack.remove(&seq).map(|e| e.packet)
    }

    /// Returns copies of all packets whose last transmission is at least one RTO ago and that are
    ///  not already queued for resending. They are marked as queued; they stay tracked until
    ///  acknowledged or removed.
    pub fn expired(&mut self, now: Instant) -> Vec<OutgoingPacket> {
        let rto = self.rtt.rto();
        self.need_ack.values_mut()
            .filter(|e| !e.awaiting_resend)
            .filter(|e| e.packet.last_send.is_some_and(|t| now.saturating_duration_since(t) >= rto))
            .map(|e| {
                e.awaiting_resend = true;
                e.packet.clone()
            })
            .collect()
    }

    /// Removes and returns packets that were first sent at least `max_age` ago
    pub fn drop_older_than(&mut self, now: Instant, max_age: Duration) -> Vec<OutgoingPacket> {
        let outdated: Vec<u32> = self.need_ack.iter()
            .filter(|(_, e)| e.packet.first_send.is_some_and(|t| now.saturating_duration_since(t) >= max_age))
            .map(|(&seq, _)| seq)
            .collect();

        outdated.into_iter()
            .filter_map(|seq| self.need_ack.remove(&seq))
            .map(|e| e.packet)
            .collect()
    }

    pub fn unacked_count(&self) -> usize {
        self.need_ack.len()
    }

    pub fn oldest_unacked(&self) -> Option<u32> {
        self.need_ack.keys().next().copied()
    }

    /// Duplicate check for an inbound reliable sequence number, recording it if it is new
    pub fn is_duplicate(&mut self, seq: u32) -> bool {
        self.seen.check_and_insert(seq)
    }

    /// Queues an inbound sequence number for acknowledgement, accounting `datagram_len` towards
    ///  the early ACK flush threshold
    pub fn queue_ack(&mut self, seq: u32, datagram_len: usize) {
        self.pending_acks.push_back(seq);
        self.bytes_since_last_ack += datagram_len;
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    pub fn bytes_since_last_ack(&self) -> usize {
        self.bytes_since_last_ack
    }

    /// the first `max` pending ACKs, without removing them
    pub fn peek_pending_acks(&mut self, max: usize) -> &[u32] {
        let n = max.min(self.pending_acks.len());
        &self.pending_acks.make_contiguous()[..n]
    }

    /// Removes and returns up to `max` pending ACKs, oldest first
    pub fn take_pending_acks(&mut self, max: usize) -> Vec<u32> {
        let n = max.min(self.pending_acks.len());
        let acks: Vec<u32> = self.pending_acks.drain(..n).collect();
        if self.pending_acks.is_empty() {
            self.bytes_since_last_ack = 0;
        }
        acks
    }

    /// Clears all state; used when the connection closes
    pub fn clear(&mut self) {
        self.need_ack.clear();
        self.pending_acks.clear();
        self.bytes_since_last_ack = 0;
    }
}
