//! The per-client protocol state: outbound category queues, sequencing, reliability and the
//!  connection's rate limiter subtree.
//!
//! All mutable per-connection state lives behind a single `Mutex` that is never held across an
//!  `.await`: the connection produces datagrams, the engine sends them. Queues are effectively
//!  confined to the outbound loop (the application only appends to them), while the receive path
//!  touches the reliability state and the liveness timestamp.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::category::ThrottleCategory;
use crate::config::TransportConfig;
use crate::events::{CloseReason, ConnectionId};
use crate::outgoing_packet::{OutgoingPacket, UnackedCallback};
use crate::rate_limiter::TokenBucket;
use crate::reliability::{ReliabilityTracker, RttEstimator};
use crate::session_authorizer::SessionInfo;
use crate::stats::ConnectionStats;
use crate::throttles::{ConnectionThrottles, RateAdjustment, ThrottleRates};
use crate::wire::control_messages::{CompletePingCheck, ControlMessage, PacketAck, StartPingCheck};
use crate::wire::framer::{append_acks, frame_message, InboundPacket, OutboundMessage};
use crate::wire::message_id::MessageId;
use crate::wire::packet_header::{PacketFlags, PacketHeader};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    /// circuit authorized, buffered datagrams being replayed
    Connecting = 0,
    Connected = 1,
    /// the client is blocked in a long-running operation: extended liveness timeout
    Paused = 2,
    Disconnected = 3,
}

/// What the inbound path should do with a datagram after connection-level bookkeeping
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InboundDisposition {
    /// process the message; `flush_acks` requests sending pending ACKs right away
    Accept { flush_acks: bool },
    Duplicate { resent: bool },
    Closed,
}

/// Datagrams produced by a connection's timers and queues in one outbound tick
#[derive(Debug, Default)]
pub struct TickOutput {
    pub datagrams: Vec<Bytes>,
    /// throttled categories (other than Resend) that have nothing left to send
    pub emptied: Vec<ThrottleCategory>,
    /// the connection skipped its category queues because of too many unacknowledged packets
    pub stalled: bool,
    pub resent: usize,
    /// unacknowledged packets dropped because they exceeded their maximum age
    pub dropped_unacked: usize,
    /// expired packets with a custom callback, removed from tracking; the caller invokes the
    ///  callbacks outside the connection's lock
    pub unacked_callbacks: Vec<OutgoingPacket>,
}

struct ConnectionInner {
    queues: [VecDeque<OutgoingPacket>; ThrottleCategory::COUNT],
    held_back: [Option<OutgoingPacket>; ThrottleCategory::COUNT],
    next_sequence: u32,
    next_ping_id: u8,
    outstanding_ping: Option<(u8, Instant)>,
    reliability: ReliabilityTracker,
    last_received: Instant,
    next_resend_check: Instant,
    next_ack_flush: Instant,
    next_ping: Instant,
    last_queue_empty: Option<Instant>,
}

pub struct Connection {
    session: SessionInfo,
    remote_addr: SocketAddr,
    config: Arc<TransportConfig>,
    state: AtomicU8,
    throttles: ConnectionThrottles,
    inner: Mutex<ConnectionInner>,
    queue_empty_busy: AtomicBool,
    packets_sent: AtomicU64,
    packets_resent: AtomicU64,
    packets_received: AtomicU64,
    ack_stalls: AtomicU64,
}

impl Connection {
    pub fn new(
        session: SessionInfo,
        remote_addr: SocketAddr,
        config: Arc<TransportConfig>,
        root_bucket: &Arc<TokenBucket>,
        now: Instant,
    ) -> Connection {
        let throttles = ConnectionThrottles::new(
            root_bucket,
            config.connection_max_rate,
            session.initial_rates.unwrap_or(config.default_category_rates),
            config.burst_time,
            config.mtu,
        );
        let rtt = RttEstimator::new(config.initial_rto, config.min_rto, config.max_rto, config.rtt_smoothing_factor);

        let inner = ConnectionInner {
            queues: Default::default(),
            held_back: Default::default(),
            next_sequence: 1,
            next_ping_id: 0,
            outstanding_ping: None,
            reliability: ReliabilityTracker::new(rtt, config.seen_sequence_capacity),
            last_received: now,
            next_resend_check: now + config.resend_check_interval,
            next_ack_flush: now + config.ack_flush_interval,
            next_ping: now + config.ping_interval,
            last_queue_empty: None,
        };

        Connection {
            session,
            remote_addr,
            config,
            state: AtomicU8::new(ConnectionState::Connecting.into()),
            throttles,
            inner: Mutex::new(inner),
            queue_empty_busy: AtomicBool::new(false),
            packets_sent: AtomicU64::new(0),
            packets_resent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            ack_stalls: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ConnectionId {
        self.session.agent_id
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn mark_connected(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Connected)
    }

    pub fn pause(&self) -> bool {
        self.transition(ConnectionState::Connected, ConnectionState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(ConnectionState::Paused, ConnectionState::Connected)
    }

    /// Moves the connection to its terminal state, dropping all queued and unacknowledged packets
    ///  and detaching its rate limiters. Returns `true` only for the call that actually closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        let prev = self.state.swap(ConnectionState::Disconnected.into(), Ordering::AcqRel);
        if prev == u8::from(ConnectionState::Disconnected) {
            return false;
        }

        debug!("closing connection {} to {:?}: {}", self.id(), self.remote_addr, reason);
        {
            let mut inner = self.lock();
            for queue in inner.queues.iter_mut() {
                queue.clear();
            }
            for held_back in inner.held_back.iter_mut() {
                *held_back = None;
            }
            inner.outstanding_ping = None;
            inner.reliability.clear();
        }
        self.throttles.detach();
        true
    }

    /// Appends a packet to its category's queue. There is no back-pressure: the queues are
    ///  unbounded.
    pub fn enqueue_outgoing(&self, packet: OutgoingPacket) -> anyhow::Result<()> {
        if !packet.category.is_throttled() {
            bail!("category {} has no outbound queue", packet.category);
        }
        if self.is_closed() {
            bail!("connection {} is closed", self.id());
        }

        trace!("queueing {:?} for {}", packet, self.id());
        self.lock().queues[packet.category.index()].push_back(packet);
        Ok(())
    }

    /// Frames a message and queues the resulting datagram(s)
    pub fn send(&self, category: ThrottleCategory, msg: &OutboundMessage, reliable: bool, on_unacked: Option<UnackedCallback>) -> anyhow::Result<()> {
        if !category.is_throttled() {
            bail!("category {} has no outbound queue", category);
        }
        for buffer in frame_message(msg, reliable, self.config.mtu)? {
            self.enqueue_outgoing(OutgoingPacket::new(category, buffer, on_unacked.clone()))?;
        }
        Ok(())
    }

    /// Connection-level bookkeeping for a parsed inbound datagram: liveness, appended ACKs, ACK
    ///  queueing and duplicate detection for reliable packets. Duplicates are acknowledged again,
    ///  since the peer evidently did not get the previous ACK.
    pub fn on_inbound(&self, packet: &InboundPacket, datagram_len: usize, now: Instant) -> InboundDisposition {
        if self.is_closed() {
            return InboundDisposition::Closed;
        }
        self.packets_received.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        inner.last_received = now;

        for &seq in &packet.appended_acks {
            inner.reliability.acknowledge(seq, now);
        }

        if !packet.is_reliable() {
            return InboundDisposition::Accept { flush_acks: false };
        }

        let seq = packet.header.sequence;
        inner.reliability.queue_ack(seq, datagram_len);
        if inner.reliability.is_duplicate(seq) {
            return InboundDisposition::Duplicate { resent: packet.is_resent() };
        }

        InboundDisposition::Accept {
            flush_acks: inner.reliability.bytes_since_last_ack() >= 2 * self.config.mtu,
        }
    }

    /// Processes ACKs for packets sent on this connection. Unknown sequence numbers are ignored.
    pub fn on_acks(&self, sequences: &[u32], now: Instant) -> usize {
        let mut inner = self.lock();
        sequences.iter()
            .filter(|&&seq| inner.reliability.acknowledge(seq, now).is_some())
            .count()
    }

    /// One outbound tick: resend timer, ACK flush timer, ping timer, then the category queues
    pub fn tick(&self, now: Instant) -> TickOutput {
        let mut output = TickOutput::default();
        if self.is_closed() {
            return output;
        }

        let mut inner = self.lock();
        if now >= inner.next_resend_check {
            inner.next_resend_check = now + self.config.resend_check_interval;
            self.collect_expired(&mut inner, now, &mut output);
        }
        if now >= inner.next_ack_flush {
            inner.next_ack_flush = now + self.config.ack_flush_interval;
            self.flush_pending_acks_locked(&mut inner, &mut output.datagrams);
        }
        if now >= inner.next_ping {
            inner.next_ping = now + self.config.ping_interval;
            if let Some(ping) = self.build_ping_locked(&mut inner, now) {
                output.datagrams.push(ping);
            }
        }
        self.dequeue_outgoing(&mut inner, now, &mut output);
        drop(inner);

        self.packets_sent.fetch_add(output.datagrams.len() as u64, Ordering::Relaxed);
        self.packets_resent.fetch_add(output.resent as u64, Ordering::Relaxed);
        if output.stalled {
            self.ack_stalls.fetch_add(1, Ordering::Relaxed);
        }
        output
    }

    fn collect_expired(&self, inner: &mut ConnectionInner, now: Instant, output: &mut TickOutput) {
        if let Some(max_age) = self.config.max_unacked_age {
            let dropped = inner.reliability.drop_older_than(now, max_age);
            if !dropped.is_empty() {
                debug!("{}: dropping {} packets that remained unacknowledged for {:?}", self.id(), dropped.len(), max_age);
                output.dropped_unacked += dropped.len();
            }
        }

        for mut packet in inner.reliability.expired(now) {
            if packet.on_unacked.is_some() {
                inner.reliability.remove(packet.sequence);
                output.unacked_callbacks.push(packet);
            }
            else {
                trace!("{}: {:?} expired - queueing for resend", self.id(), packet);
                packet.category = ThrottleCategory::Resend;
                inner.queues[ThrottleCategory::Resend.index()].push_back(packet);
            }
        }
    }

    /// Sends everything that is due from the category queues: Resend is serviced first; then, unless
    ///  too many packets are unacknowledged, every other category gets one attempt.
    fn dequeue_outgoing(&self, inner: &mut ConnectionInner, now: Instant, output: &mut TickOutput) {
        if let Some(datagram) = self.try_send_category(inner, ThrottleCategory::Resend, now) {
            output.datagrams.push(datagram);
            output.resent += 1;
        }

        if inner.reliability.unacked_count() > self.config.unacked_high_water_mark {
            trace!("{}: {} unacknowledged packets - skipping category queues", self.id(), inner.reliability.unacked_count());
            output.stalled = true;
            return;
        }

        for category in &ThrottleCategory::ALL[1..] {
            if let Some(datagram) = self.try_send_category(inner, *category, now) {
                output.datagrams.push(datagram);
            }
            let i = category.index();
            if inner.queues[i].is_empty() && inner.held_back[i].is_none() {
                output.emptied.push(*category);
            }
        }
    }

    fn try_send_category(&self, inner: &mut ConnectionInner, category: ThrottleCategory, now: Instant) -> Option<Bytes> {
        let i = category.index();
        let packet = loop {
            let candidate = inner.held_back[i].take()
                .or_else(|| inner.queues[i].pop_front())?;

            // a queued resend may have been acknowledged in the meantime
            if candidate.sequence != 0 && !inner.reliability.is_unacked(candidate.sequence) {
                continue;
            }
            break candidate;
        };

        if !self.throttles.try_consume(category, packet.len(), now) {
            inner.held_back[i] = Some(packet);
            return None;
        }
        Some(self.transmit(inner, packet, now))
    }

    /// Finalizes a packet for sending: assigns the sequence number on first transmission, sets the
    ///  RESENT flag otherwise, piggybacks pending ACKs and registers reliable packets for
    ///  acknowledgement.
    fn transmit(&self, inner: &mut ConnectionInner, mut packet: OutgoingPacket, now: Instant) -> Bytes {
        let mut datagram = BytesMut::from(packet.buffer.as_ref());
        let reliable = packet.is_reliable();
        let is_resend = packet.sequence != 0;

        if is_resend {
            let flags = packet.flags() | PacketFlags::RESENT;
            PacketHeader::patch_flags(&mut datagram, flags);
            inner.reliability.register_resent(packet.sequence, now);
        }
        else {
            packet.sequence = inner.next_sequence;
            inner.next_sequence = inner.next_sequence.wrapping_add(1).max(1);
            PacketHeader::patch_sequence(&mut datagram, packet.sequence);
            // resends reuse the stored buffer
            packet.buffer = Bytes::copy_from_slice(&datagram);
        }

        // packets with an unacked callback are not used for piggybacking
        if reliable && packet.on_unacked.is_none() {
            let num_appended = {
                let acks = inner.reliability.peek_pending_acks(PacketAck::MAX_ACKS);
                append_acks(&mut datagram, acks, self.config.mtu)
            };
            inner.reliability.take_pending_acks(num_appended);
        }

        trace!("{}: sending {:?}", self.id(), packet);
        if reliable && !is_resend {
            packet.first_send = Some(now);
            packet.last_send = Some(now);
            inner.reliability.register_sent(packet);
        }
        datagram.freeze()
    }

    /// Sends all pending ACKs as standalone ACK datagrams
    pub fn flush_pending_acks(&self) -> Vec<Bytes> {
        let mut datagrams = Vec::new();
        self.flush_pending_acks_locked(&mut self.lock(), &mut datagrams);
        self.packets_sent.fetch_add(datagrams.len() as u64, Ordering::Relaxed);
        datagrams
    }

    fn flush_pending_acks_locked(&self, inner: &mut ConnectionInner, datagrams: &mut Vec<Bytes>) {
        let max_per_datagram = self.max_acks_per_datagram();
        while inner.reliability.pending_ack_count() > 0 {
            let sequences = inner.reliability.take_pending_acks(max_per_datagram);
            match Self::frame_control(&ControlMessage::PacketAck(PacketAck { sequences }), self.config.mtu) {
                Ok(datagram) => datagrams.push(datagram),
                Err(e) => {
                    warn!("{}: could not frame ACK message: {}", self.id(), e);
                    break;
                }
            }
        }
    }

    fn max_acks_per_datagram(&self) -> usize {
        let overhead = PacketHeader::PREFIX_LEN + MessageId::PACKET_ACK.encoded_len() + PacketAck::serialized_len(0);
        (self.config.mtu.saturating_sub(overhead) / 4).clamp(1, PacketAck::MAX_ACKS)
    }

    fn frame_control(msg: &ControlMessage, mtu: usize) -> anyhow::Result<Bytes> {
        let mut datagrams = frame_message(&OutboundMessage::control(msg), false, mtu)?;
        if datagrams.len() != 1 {
            bail!("control message {:?} does not fit into a single datagram", msg.message_id());
        }
        Ok(datagrams.remove(0))
    }

    /// Creates a ping request, remembering its id and send time for the RTT sample
    pub fn build_ping(&self, now: Instant) -> Option<Bytes> {
        let ping = self.build_ping_locked(&mut self.lock(), now);
        if ping.is_some() {
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
        }
        ping
    }

    fn build_ping_locked(&self, inner: &mut ConnectionInner, now: Instant) -> Option<Bytes> {
        let ping_id = inner.next_ping_id;
        inner.next_ping_id = inner.next_ping_id.wrapping_add(1);

        let oldest_unacked = inner.reliability.oldest_unacked().unwrap_or(inner.next_sequence);
        let msg = ControlMessage::StartPingCheck(StartPingCheck { ping_id, oldest_unacked });
        match Self::frame_control(&msg, self.config.mtu) {
            Ok(datagram) => {
                inner.outstanding_ping = Some((ping_id, now));
                Some(datagram)
            }
            Err(e) => {
                warn!("{}: could not frame ping: {}", self.id(), e);
                None
            }
        }
    }

    /// the response to a peer's ping request
    pub fn on_ping_request(&self, ping: StartPingCheck) -> anyhow::Result<Bytes> {
        Self::frame_control(&ControlMessage::CompletePingCheck(CompletePingCheck { ping_id: ping.ping_id }), self.config.mtu)
    }

    /// Takes an RTT sample if `ping_id` answers the outstanding ping. Stale or unexpected pong
    ///  messages are ignored.
    pub fn on_pong(&self, ping_id: u8, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.outstanding_ping {
            Some((id, sent)) if id == ping_id => {
                inner.outstanding_ping = None;
                inner.reliability.on_rtt_sample(now.saturating_duration_since(sent));
                true
            }
            _ => {
                trace!("{}: ignoring pong {}", self.id(), ping_id);
                false
            }
        }
    }

    pub fn set_throttles(&self, requested: ThrottleRates, now: Instant) -> RateAdjustment {
        self.throttles.set_rates(requested, now)
    }

    pub fn throttles(&self) -> ThrottleRates {
        self.throttles.rates()
    }

    /// current category rates in the 28-byte wire form
    pub fn throttles_packed(&self, multiplier: f32) -> Bytes {
        let mut buf = BytesMut::with_capacity(ThrottleRates::PACKED_LEN);
        self.throttles.rates().ser_packed(multiplier, &mut buf);
        buf.freeze()
    }

    pub fn liveness_timeout(&self) -> std::time::Duration {
        if self.state() == ConnectionState::Paused {
            self.config.paused_liveness_timeout
        }
        else {
            self.config.liveness_timeout
        }
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        let last_received = self.lock().last_received;
        now.saturating_duration_since(last_received) > self.liveness_timeout()
    }

    /// Reserves the right to issue a 'queue empty' notification: at most one may be in flight, and
    ///  consecutive notifications are at least the configured interval apart. Call
    ///  [Connection::queue_empty_done] when the notification completes.
    pub fn try_begin_queue_empty(&self, now: Instant) -> bool {
        {
            let inner = self.lock();
            if let Some(last) = inner.last_queue_empty {
                if now.saturating_duration_since(last) < self.config.queue_empty_min_interval {
                    return false;
                }
            }
        }
        if self.queue_empty_busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return false;
        }
        self.lock().last_queue_empty = Some(now);
        true
    }

    pub fn queue_empty_done(&self) {
        self.queue_empty_busy.store(false, Ordering::Release);
    }

    pub fn is_queue_empty_busy(&self) -> bool {
        self.queue_empty_busy.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.lock();
        let mut queue_depths = [0usize; ThrottleCategory::COUNT];
        for (i, depth) in queue_depths.iter_mut().enumerate() {
            *depth = inner.queues[i].len() + usize::from(inner.held_back[i].is_some());
        }

        ConnectionStats {
            connection_id: self.id(),
            remote_addr: self.remote_addr,
            state: self.state(),
            queue_depths,
            unacked: inner.reliability.unacked_count(),
            pending_acks: inner.reliability.pending_ack_count(),
            srtt: inner.reliability.rtt().srtt(),
            rto: inner.reliability.rtt().rto(),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_resent: self.packets_resent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            ack_stalls: self.ack_stalls.load(Ordering::Relaxed),
            rates: self.throttles.rates(),
        }
    }
}
