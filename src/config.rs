use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::category::ThrottleCategory;
use crate::throttles::ThrottleRates;

pub struct TransportConfig {
    pub bind_addr: SocketAddr,

    /// Maximum size of a datagram on the wire, including header, message id, payload and appended
    ///  ACKs. Messages that do not fit are split (if their message type allows it) or rejected.
    pub mtu: usize,

    /// Server-wide outbound rate in bytes per second, shared by all connections. 0 means
    ///  'unlimited'.
    pub server_rate: u64,
    /// Maximum total outbound rate of a single connection in bytes per second. The sum of the
    ///  category rates is never negotiated above this.
    pub connection_max_rate: u64,
    /// category rates a connection starts out with, before the peer negotiates its own
    pub default_category_rates: ThrottleRates,
    /// A bucket can accumulate `rate * burst_time` bytes (but at least one MTU)
    pub burst_time: Duration,
    /// The peer expects throttle values echoed back to it scaled by this factor
    pub throttle_echo_multiplier: f32,

    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// weight of a new RTT sample in the smoothed RTT
    pub rtt_smoothing_factor: f64,

    pub resend_check_interval: Duration,
    pub ack_flush_interval: Duration,
    pub ping_interval: Duration,
    /// A connection that received nothing for this long is closed
    pub liveness_timeout: Duration,
    /// liveness timeout for a connection that is [Paused](crate::connection::ConnectionState::Paused)
    pub paused_liveness_timeout: Duration,
    /// Reliable packets still unacknowledged after this age are dropped instead of resent.
    ///  `None` resends until the connection closes.
    pub max_unacked_age: Option<Duration>,

    /// Number of unacknowledged reliable packets above which a connection stops sending from its
    ///  category queues until ACKs catch up
    pub unacked_high_water_mark: usize,
    /// number of recently received reliable sequence numbers remembered for duplicate detection
    pub seen_sequence_capacity: usize,
    /// Number of datagrams buffered per remote address while its circuit handshake is in progress
    pub max_pending_circuit_datagrams: usize,
    pub pending_circuit_shards: usize,

    /// capacity of the queue between the receive loop and the decode loop
    pub inbound_queue_capacity: usize,
    /// The decode loop waits this long for a datagram before checking for shutdown
    pub inbound_poll_timeout: Duration,
    /// The outbound loop sleeps this long after a tick in which nothing was sent
    pub idle_sleep: Duration,

    /// minimum time between two 'queue empty' notifications for the same connection
    pub queue_empty_min_interval: Duration,
    /// number of queue empty notifications that can be waiting for execution
    pub job_queue_capacity: usize,
    pub num_job_workers: usize,
}

impl TransportConfig {
    pub const MIN_MTU: usize = 128;

    pub fn default_for(bind_addr: SocketAddr) -> TransportConfig {
        TransportConfig {
            bind_addr,
            mtu: 1400,
            server_rate: 0,
            connection_max_rate: 1_500_000,
            default_category_rates: ThrottleRates::new(12_500, 62_500, 12_500, 12_500, 62_500, 125_000, 125_000),
            burst_time: Duration::from_secs(1),
            throttle_echo_multiplier: 1.0,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(500),
            max_rto: Duration::from_secs(20),
            rtt_smoothing_factor: 0.125,
            resend_check_interval: Duration::from_millis(100),
            ack_flush_interval: Duration::from_millis(500),
            ping_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(60),
            paused_liveness_timeout: Duration::from_secs(300),
            max_unacked_age: None,
            unacked_high_water_mark: 50,
            seen_sequence_capacity: 1000,
            max_pending_circuit_datagrams: 50,
            pending_circuit_shards: 16,
            inbound_queue_capacity: 4096,
            inbound_poll_timeout: Duration::from_millis(100),
            idle_sleep: Duration::from_millis(5),
            queue_empty_min_interval: Duration::from_millis(20),
            job_queue_capacity: 1024,
            num_job_workers: 2,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < Self::MIN_MTU {
            bail!("MTU {} is too small - minimum is {}", self.mtu, Self::MIN_MTU);
        }
        if self.min_rto.is_zero() {
            bail!("minimum RTO must be positive");
        }
        if self.min_rto > self.max_rto {
            bail!("minimum RTO {:?} is bigger than maximum RTO {:?}", self.min_rto, self.max_rto);
        }
        if self.initial_rto < self.min_rto || self.initial_rto > self.max_rto {
            bail!("initial RTO {:?} is outside [{:?}, {:?}]", self.initial_rto, self.min_rto, self.max_rto);
        }
        if !(self.rtt_smoothing_factor > 0.0 && self.rtt_smoothing_factor <= 1.0) {
            bail!("RTT smoothing factor must be in (0, 1], was {}", self.rtt_smoothing_factor);
        }

        let floor_sum: u64 = ThrottleCategory::ALL.iter().map(|c| c.rate_floor()).sum();
        if self.connection_max_rate < floor_sum {
            bail!("connection max rate {} is below the sum of category floors {}", self.connection_max_rate, floor_sum);
        }
        if self.server_rate != 0 && self.server_rate < self.mtu as u64 {
            bail!("server rate {} does not allow a single full-size datagram per second", self.server_rate);
        }
        if self.burst_time.is_zero() {
            bail!("burst time must be positive");
        }
        if !(self.throttle_echo_multiplier.is_finite() && self.throttle_echo_multiplier > 0.0) {
            bail!("throttle echo multiplier must be positive");
        }

        if self.resend_check_interval.is_zero() || self.ack_flush_interval.is_zero() || self.ping_interval.is_zero() {
            bail!("timer intervals must be positive");
        }
        if self.liveness_timeout.is_zero() || self.paused_liveness_timeout < self.liveness_timeout {
            bail!("paused liveness timeout must be at least the regular liveness timeout, which must be positive");
        }

        if self.unacked_high_water_mark == 0 {
            bail!("unacked high-water mark must be positive");
        }
        if self.seen_sequence_capacity == 0 {
            bail!("seen sequence capacity must be positive");
        }
        if self.pending_circuit_shards == 0 {
            bail!("number of pending circuit shards must be positive");
        }
        if self.inbound_queue_capacity == 0 || self.job_queue_capacity == 0 {
            bail!("queue capacities must be positive");
        }
        if self.num_job_workers == 0 {
            bail!("at least one job worker is required");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    #[test]
    fn test_default_is_valid() {
        assert!(TransportConfig::default_for(addr()).validate().is_ok());
    }

    #[rstest]
    #[case::mtu_too_small(|c: &mut TransportConfig| c.mtu = 100)]
    #[case::min_rto_zero(|c: &mut TransportConfig| c.min_rto = Duration::ZERO)]
    #[case::min_above_max(|c: &mut TransportConfig| c.min_rto = Duration::from_secs(30))]
    #[case::initial_outside(|c: &mut TransportConfig| c.initial_rto = Duration::from_millis(100))]
    #[case::smoothing_zero(|c: &mut TransportConfig| c.rtt_smoothing_factor = 0.0)]
    #[case::max_below_floors(|c: &mut TransportConfig| c.connection_max_rate = 4000)]
    #[case::server_rate_tiny(|c: &mut TransportConfig| c.server_rate = 10)]
    #[case::burst_zero(|c: &mut TransportConfig| c.burst_time = Duration::ZERO)]
    #[case::multiplier_negative(|c: &mut TransportConfig| c.throttle_echo_multiplier = -1.0)]
    #[case::ping_zero(|c: &mut TransportConfig| c.ping_interval = Duration::ZERO)]
    #[case::paused_shorter(|c: &mut TransportConfig| c.paused_liveness_timeout = Duration::from_secs(1))]
    #[case::high_water_zero(|c: &mut TransportConfig| c.unacked_high_water_mark = 0)]
    #[case::seen_zero(|c: &mut TransportConfig| c.seen_sequence_capacity = 0)]
    #[case::shards_zero(|c: &mut TransportConfig| c.pending_circuit_shards = 0)]
    #[case::job_queue_zero(|c: &mut TransportConfig| c.job_queue_capacity = 0)]
    #[case::no_job_workers(|c: &mut TransportConfig| c.num_job_workers = 0)]
    fn test_validate_rejects(#[case] modify: fn(&mut TransportConfig)) {
        let mut config = TransportConfig::default_for(addr());
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
