use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use crate::category::ThrottleCategory;
use crate::connection::ConnectionState;
use crate::events::ConnectionId;
use crate::throttles::ThrottleRates;
use std::net::SocketAddr;

/// Why an inbound datagram was dropped
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DropReason {
    /// undersized, inconsistent header, unparseable message id or control message body
    Malformed,
    /// no connection and no handshake for the sender's address
    Orphaned,
    /// an already accepted reliable sequence number
    Duplicate,
}

/// Engine-wide counters. They are updated concurrently from all engine loops and read without
///  synchronization between them, so a snapshot is not necessarily consistent across counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    datagrams_received: AtomicU64,
    datagrams_sent: AtomicU64,
    packets_resent: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_orphaned: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_unacked: AtomicU64,
    ack_stalls: AtomicU64,
    handshakes_denied: AtomicU64,
    connections_established: AtomicU64,
    connections_closed: AtomicU64,
    jobs_rejected: AtomicU64,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TransportStatsSnapshot {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub packets_resent: u64,
    pub dropped_malformed: u64,
    pub dropped_orphaned: u64,
    pub dropped_duplicate: u64,
    pub dropped_unacked: u64,
    pub ack_stalls: u64,
    pub handshakes_denied: u64,
    pub connections_established: u64,
    pub connections_closed: u64,
    pub jobs_rejected: u64,
}

impl TransportStats {
    pub fn on_dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::Orphaned => &self.dropped_orphaned,
            DropReason::Duplicate => &self.dropped_duplicate,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_sent(&self, num_datagrams: usize) {
        self.datagrams_sent.fetch_add(num_datagrams as u64, Ordering::Relaxed);
    }

    pub fn on_resent(&self, num_packets: usize) {
        self.packets_resent.fetch_add(num_packets as u64, Ordering::Relaxed);
    }

    pub fn on_dropped_unacked(&self, num_packets: usize) {
        self.dropped_unacked.fetch_add(num_packets as u64, Ordering::Relaxed);
    }

    pub fn on_ack_stall(&self) {
        self.ack_stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_handshake_denied(&self) {
        self.handshakes_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_job_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            packets_resent: self.packets_resent.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_orphaned: self.dropped_orphaned.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            dropped_unacked: self.dropped_unacked.load(Ordering::Relaxed),
            ack_stalls: self.ack_stalls.load(Ordering::Relaxed),
            handshakes_denied: self.handshakes_denied.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
        }
    }
}

/// point-in-time view of a single connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub connection_id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub state: ConnectionState,
    pub queue_depths: [usize; ThrottleCategory::COUNT],
    pub unacked: usize,
    pub pending_acks: usize,
    pub srtt: Option<Duration>,
    pub rto: Duration,
    pub packets_sent: u64,
    pub packets_resent: u64,
    pub packets_received: u64,
    pub ack_stalls: u64,
    pub rates: ThrottleRates,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::malformed(DropReason::Malformed, TransportStatsSnapshot { dropped_malformed: 1, ..Default::default() })]
    #[case::orphaned(DropReason::Orphaned, TransportStatsSnapshot { dropped_orphaned: 1, ..Default::default() })]
    #[case::duplicate(DropReason::Duplicate, TransportStatsSnapshot { dropped_duplicate: 1, ..Default::default() })]
    fn test_on_dropped(#[case] reason: DropReason, #[case] expected: TransportStatsSnapshot) {
        let stats = TransportStats::default();
        stats.on_dropped(reason);
        assert_eq!(stats.snapshot(), expected);
    }

    #[test]
    fn test_counters() {
        let stats = TransportStats::default();
        stats.on_sent(3);
        stats.on_sent(2);
        stats.on_resent(1);
        stats.on_received();
        assert_eq!(stats.snapshot(), TransportStatsSnapshot {
            datagrams_sent: 5,
            packets_resent: 1,
            datagrams_received: 1,
            ..Default::default()
        });
    }
}
