//! The transport engine: it owns the socket and the connection table, and it runs the three
//!  loops that drive the protocol.
//!
//! * The **receive loop** reads datagrams from the socket and hands them to a bounded queue.
//!   When the queue is full, datagrams are dropped the same way the network would drop them.
//! * The **decode loop** takes datagrams from that queue and runs them through the inbound
//!   pipeline: parsing, connection lookup (or circuit setup), reliability bookkeeping, control
//!   message handling and dispatch to the application.
//! * The **outbound loop** ticks all connections, sending whatever their timers and category
//!   queues produce within their rate limits, and tears down connections that went silent.
//!
//! Circuit setup runs as a separate task per request so that a slow session lookup does not
//!  block the decode loop. Datagrams arriving from an address while its setup request is being
//!  authorized are buffered and replayed once the connection exists.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use anyhow::bail;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;
use crate::category::ThrottleCategory;
use crate::config::TransportConfig;
use crate::connection::{Connection, InboundDisposition};
use crate::events::{CloseReason, ConnectionId, TransportEvent};
use crate::job_engine::JobEngine;
use crate::message_dispatcher::{InboundMessage, MessageDispatcher};
use crate::outgoing_packet::UnackedCallback;
use crate::queue_empty::QueueEmptyHandler;
use crate::rate_limiter::TokenBucket;
use crate::session_authorizer::{AuthorizationResult, SessionAuthorizer, SessionInfo};
use crate::socket::DatagramSocket;
use crate::stats::{ConnectionStats, DropReason, TransportStats, TransportStatsSnapshot};
use crate::throttles::burst_for_rate;
use crate::util::atomic_map::AtomicMap;
use crate::util::sharded_map::ShardedMap;
use crate::wire::control_messages::{ControlMessage, UseCircuitCode};
use crate::wire::framer::{parse_datagram, InboundPacket, OutboundMessage};
use crate::wire::message_id::MessageId;

/// large enough for any UDP payload
const RECEIVE_BUFFER_LEN: usize = 65536;

/// Connections, looked up by remote address on the receive path and by agent on the API
#[derive(Default)]
struct ConnectionTable {
    by_addr: AtomicMap<SocketAddr, Arc<Connection>>,
    by_id: AtomicMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionTable {
    fn by_addr(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.by_addr.get(addr)
    }

    fn by_id(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.by_id.get(connection_id)
    }

    /// Returns the connections the new one displaced, either by agent or by remote address. They
    ///  are still registered under their other key and must be closed by the caller.
    fn insert(&self, connection: Arc<Connection>) -> Vec<Arc<Connection>> {
        let mut displaced: Vec<Arc<Connection>> = Vec::new();
        let previous_at_addr = self.by_addr.update(|m| m.insert(connection.remote_addr(), connection.clone()));
        let previous_for_id = self.by_id.update(|m| m.insert(connection.id(), connection.clone()));
        for previous in previous_at_addr.into_iter().chain(previous_for_id) {
            if !Arc::ptr_eq(&previous, &connection) && !displaced.iter().any(|c| Arc::ptr_eq(c, &previous)) {
                displaced.push(previous);
            }
        }
        displaced
    }

    /// removes the connection, leaving entries alone that were replaced by a newer connection
    fn remove(&self, connection: &Arc<Connection>) {
        let addr = connection.remote_addr();
        self.by_addr.update(|m| {
            if m.get(&addr).is_some_and(|c| Arc::ptr_eq(c, connection)) {
                m.remove(&addr);
            }
        });
        let id = connection.id();
        self.by_id.update(|m| {
            if m.get(&id).is_some_and(|c| Arc::ptr_eq(c, connection)) {
                m.remove(&id);
            }
        });
    }
}

/// where an inbound datagram goes after connection lookup
enum Route {
    Connection(Arc<Connection>),
    Handshake(UseCircuitCode),
    Buffered,
    Dropped(DropReason),
}

pub struct TransportEngine {
    config: Arc<TransportConfig>,
    socket: Arc<dyn DatagramSocket>,
    connections: ConnectionTable,
    /// datagrams from addresses whose circuit setup request is being authorized
    pending_circuits: ShardedMap<SocketAddr, Vec<Bytes>>,
    root_bucket: Arc<TokenBucket>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    session_authorizer: Arc<dyn SessionAuthorizer>,
    queue_empty_handler: Arc<dyn QueueEmptyHandler>,
    job_engine: JobEngine,
    stats: TransportStats,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: watch::Sender<bool>,
    inbound_sender: mpsc::Sender<(Bytes, SocketAddr)>,
    inbound_receiver: Mutex<Option<mpsc::Receiver<(Bytes, SocketAddr)>>>,
}

impl TransportEngine {
    /// Creates an engine on an existing socket. Lifecycle events are delivered through the
    ///  returned channel. Nothing is received or sent before [TransportEngine::start] is called.
    pub fn new(
        config: Arc<TransportConfig>,
        socket: Arc<dyn DatagramSocket>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
        session_authorizer: Arc<dyn SessionAuthorizer>,
        queue_empty_handler: Arc<dyn QueueEmptyHandler>,
    ) -> anyhow::Result<(Arc<TransportEngine>, mpsc::UnboundedReceiver<TransportEvent>)> {
        config.validate()?;

        let root_burst = if config.server_rate == 0 {
            0
        }
        else {
            burst_for_rate(config.server_rate, config.burst_time, config.mtu)
        };
        let (events, event_receiver) = mpsc::unbounded_channel();
        let (inbound_sender, inbound_receiver) = mpsc::channel(config.inbound_queue_capacity);
        let (shutdown, _) = watch::channel(false);

        let engine = TransportEngine {
            socket,
            connections: Default::default(),
            pending_circuits: ShardedMap::new(config.pending_circuit_shards),
            root_bucket: TokenBucket::new_root(config.server_rate, root_burst),
            message_dispatcher,
            session_authorizer,
            queue_empty_handler,
            job_engine: JobEngine::new(config.job_queue_capacity),
            stats: Default::default(),
            events,
            shutdown,
            inbound_sender,
            inbound_receiver: Mutex::new(Some(inbound_receiver)),
            config,
        };
        Ok((Arc::new(engine), event_receiver))
    }

    /// Binds a UDP socket to the configured address and creates an engine on it
    pub async fn bind(
        config: Arc<TransportConfig>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
        session_authorizer: Arc<dyn SessionAuthorizer>,
        queue_empty_handler: Arc<dyn QueueEmptyHandler>,
    ) -> anyhow::Result<(Arc<TransportEngine>, mpsc::UnboundedReceiver<TransportEvent>)> {
        config.validate()?;

        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!("bound UDP socket to {:?}", socket.local_addr()?);
        Self::new(config, Arc::new(socket), message_dispatcher, session_authorizer, queue_empty_handler)
    }

    /// Spawns the receive, decode and outbound loops and the job workers. They run until
    ///  [TransportEngine::shutdown] is called. Starting an engine a second time has no effect.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let inbound_receiver = self.inbound_receiver.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(inbound_receiver) = inbound_receiver else {
            warn!("transport engine was already started");
            return Vec::new();
        };

        info!("starting transport engine on {:?}", self.socket.local_addr().ok());
        let mut handles = self.job_engine.start(self.config.num_job_workers, self.shutdown.subscribe());
        handles.push(tokio::spawn(self.clone().recv_loop()));
        handles.push(tokio::spawn(self.clone().decode_loop(inbound_receiver)));
        handles.push(tokio::spawn(self.clone().outbound_loop()));
        handles
    }

    /// Stops all loops. Connections are left as they are, without notifying peers.
    pub fn shutdown(&self) {
        info!("shutting down transport engine");
        self.shutdown.send_replace(true);
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Queues a message for sending on a connection. Reliable messages are resent until they are
    ///  acknowledged; if `on_unacked` is given, it is called instead of the first resend.
    pub fn send(
        &self,
        connection_id: ConnectionId,
        category: ThrottleCategory,
        msg: &OutboundMessage,
        reliable: bool,
        on_unacked: Option<UnackedCallback>,
    ) -> anyhow::Result<()> {
        let Some(connection) = self.connections.by_id(&connection_id) else {
            bail!("no connection for {}", connection_id);
        };
        connection.send(category, msg, reliable, on_unacked)
    }

    /// Closes a connection, returning `false` if there is no such connection
    pub fn close(&self, connection_id: ConnectionId, reason: CloseReason) -> bool {
        match self.connections.by_id(&connection_id) {
            Some(connection) => self.close_connection(&connection, reason),
            None => false,
        }
    }

    /// Extends a connection's liveness timeout while the client is blocked, e.g. during a
    ///  region crossing
    pub fn pause(&self, connection_id: ConnectionId) -> bool {
        self.connections.by_id(&connection_id)
            .is_some_and(|c| c.pause())
    }

    pub fn resume(&self, connection_id: ConnectionId) -> bool {
        self.connections.by_id(&connection_id)
            .is_some_and(|c| c.resume())
    }

    /// A connection's current category rates in wire form, scaled by the configured echo
    ///  multiplier, for sending them back to the client
    pub fn throttles_packed(&self, connection_id: ConnectionId) -> Option<Bytes> {
        self.connections.by_id(&connection_id)
            .map(|c| c.throttles_packed(self.config.throttle_echo_multiplier))
    }

    pub fn connection_stats(&self, connection_id: ConnectionId) -> Option<ConnectionStats> {
        self.connections.by_id(&connection_id)
            .map(|c| c.stats())
    }

    pub fn connections(&self) -> Vec<ConnectionStats> {
        self.connections.by_id.load()
            .values()
            .map(|c| c.stats())
            .collect()
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop");

        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; RECEIVE_BUFFER_LEN];
        while !self.is_shutting_down() {
            let received = tokio::select! {
                received = self.socket.recv_datagram(&mut buf) => received,
                _ = shutdown.changed() => break,
            };
            let (num_read, from) = match received {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            self.stats.on_received();
            if self.inbound_sender.try_send((Bytes::copy_from_slice(&buf[..num_read]), from)).is_err() {
                debug!("inbound queue is full - dropping datagram from {:?}", from);
            }
        }
        info!("receive loop finished");
    }

    async fn decode_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<(Bytes, SocketAddr)>) {
        while !self.is_shutting_down() {
            match timeout(self.config.inbound_poll_timeout, inbound.recv()).await {
                Ok(Some((datagram, from))) => self.process_datagram(datagram, from).await,
                Ok(None) => break,
                Err(_) => {}
            }
        }
        info!("decode loop finished");
    }

    async fn outbound_loop(self: Arc<Self>) {
        while !self.is_shutting_down() {
            if self.tick(Instant::now()).await {
                tokio::task::yield_now().await;
            }
            else {
                sleep(self.config.idle_sleep).await;
            }
        }
        info!("outbound loop finished");
    }

    async fn process_datagram(self: &Arc<Self>, datagram: Bytes, from: SocketAddr) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        self.on_datagram(datagram, from)
            .instrument(span)
            .await
    }

    async fn on_datagram(self: &Arc<Self>, datagram: Bytes, from: SocketAddr) {
        trace!("received {} bytes from {:?}", datagram.len(), from);

        let datagram_len = datagram.len();
        let Some(packet) = self.parse(datagram.clone(), from) else {
            return;
        };

        match self.route(&packet, &datagram, from) {
            Route::Connection(connection) => {
                self.on_connection_packet(&connection, packet, datagram_len).await;
            }
            Route::Handshake(request) => {
                self.begin_handshake(request, packet, datagram_len, from);
            }
            Route::Buffered => {
                trace!("buffered datagram from {:?} pending circuit setup", from);
            }
            Route::Dropped(reason) => {
                debug!("dropping {:?} datagram from {:?}", reason, from);
                self.stats.on_dropped(reason);
            }
        }
    }

    fn parse(&self, datagram: Bytes, from: SocketAddr) -> Option<InboundPacket> {
        match parse_datagram(datagram, self.config.mtu) {
            Ok(packet) => Some(packet),
            Err(e) => {
                debug!("malformed datagram from {:?}: {} - dropping", from, e);
                self.stats.on_dropped(DropReason::Malformed);
                None
            }
        }
    }

    fn route(&self, packet: &InboundPacket, datagram: &Bytes, from: SocketAddr) -> Route {
        if let Some(connection) = self.connections.by_addr(&from) {
            return Route::Connection(connection);
        }

        // re-checked under the shard lock: circuit setup completes under the same lock
        self.pending_circuits.with_shard(&from, |pending| {
            if let Some(connection) = self.connections.by_addr(&from) {
                return Route::Connection(connection);
            }

            if let Some(buffered) = pending.get_mut(&from) {
                if buffered.len() < self.config.max_pending_circuit_datagrams {
                    buffered.push(datagram.clone());
                    return Route::Buffered;
                }
                debug!("too many datagrams from {:?} pending circuit setup", from);
                return Route::Dropped(DropReason::Orphaned);
            }

            if packet.message_id != MessageId::USE_CIRCUIT_CODE {
                return Route::Dropped(DropReason::Orphaned);
            }
            match UseCircuitCode::deser(&mut packet.payload.clone()) {
                Ok(request) => {
                    pending.insert(from, Vec::new());
                    Route::Handshake(request)
                }
                Err(e) => {
                    debug!("malformed circuit setup request from {:?}: {}", from, e);
                    Route::Dropped(DropReason::Malformed)
                }
            }
        })
    }

    fn begin_handshake(self: &Arc<Self>, request: UseCircuitCode, setup: InboundPacket, datagram_len: usize, from: SocketAddr) {
        debug!("circuit setup request from {:?} for agent {}", from, request.agent_id);

        let engine = self.clone();
        tokio::spawn(async move {
            let authorization = engine.session_authorizer
                .authorize(request.session_id, request.agent_id, request.circuit_code)
                .await;

            match authorization {
                AuthorizationResult::Authorized(session) => {
                    engine.complete_handshake(session, setup, datagram_len, from).await;
                }
                AuthorizationResult::Denied => {
                    info!("denied circuit for agent {} from {:?}", request.agent_id, from);
                    engine.pending_circuits.remove(&from);
                    engine.stats.on_handshake_denied();
                }
            }
        }.instrument(Span::current()));
    }

    async fn complete_handshake(&self, session: SessionInfo, setup: InboundPacket, datagram_len: usize, from: SocketAddr) {
        let now = Instant::now();
        let connection = Arc::new(Connection::new(session, from, self.config.clone(), &self.root_bucket, now));

        let (buffered, displaced) = self.pending_circuits.with_shard(&from, |pending| {
            let buffered = pending.remove(&from).unwrap_or_default();
            (buffered, self.connections.insert(connection.clone()))
        });
        for previous in displaced {
            self.close_connection(&previous, CloseReason::Superseded);
        }

        // the setup request is acknowledged before anything else is sent on the circuit
        connection.on_inbound(&setup, datagram_len, now);
        self.send_datagrams(from, &connection.flush_pending_acks()).await;

        connection.mark_connected();
        self.stats.on_connection_established();
        info!("established circuit for agent {} from {:?}", connection.id(), from);
        let _ = self.events.send(TransportEvent::Established {
            connection_id: connection.id(),
            remote_addr: from,
            session: connection.session().clone(),
        });

        for datagram in buffered {
            let datagram_len = datagram.len();
            if let Some(packet) = self.parse(datagram, from) {
                self.on_connection_packet(&connection, packet, datagram_len).await;
            }
        }
    }

    async fn on_connection_packet(&self, connection: &Arc<Connection>, packet: InboundPacket, datagram_len: usize) {
        match connection.on_inbound(&packet, datagram_len, Instant::now()) {
            InboundDisposition::Accept { flush_acks } => {
                if flush_acks {
                    self.send_datagrams(connection.remote_addr(), &connection.flush_pending_acks()).await;
                }
            }
            InboundDisposition::Duplicate { resent } => {
                if resent {
                    debug!("{}: dropping resent duplicate #{}", connection.id(), packet.header.sequence);
                }
                else {
                    warn!("{}: duplicate #{} without RESENT flag", connection.id(), packet.header.sequence);
                }
                self.stats.on_dropped(DropReason::Duplicate);
                return;
            }
            InboundDisposition::Closed => {
                trace!("{}: dropping datagram for closed connection", connection.id());
                self.stats.on_dropped(DropReason::Orphaned);
                return;
            }
        }

        match ControlMessage::deser(packet.message_id, &mut packet.payload.clone()) {
            Ok(Some(msg)) => self.on_control_message(connection, msg).await,
            Ok(None) => {
                let message = InboundMessage {
                    message_id: packet.message_id,
                    sequence: packet.header.sequence,
                    reliable: packet.is_reliable(),
                    payload: packet.payload,
                };
                self.message_dispatcher.on_message(connection.id(), message).await;
            }
            Err(e) => {
                debug!("{}: malformed {} message: {}", connection.id(), packet.message_id, e);
                self.stats.on_dropped(DropReason::Malformed);
            }
        }
    }

    async fn on_control_message(&self, connection: &Arc<Connection>, msg: ControlMessage) {
        let now = Instant::now();
        match msg {
            ControlMessage::PacketAck(ack) => {
                let num_acked = connection.on_acks(&ack.sequences, now);
                trace!("{}: {} of {} ACKs matched", connection.id(), num_acked, ack.sequences.len());
            }
            ControlMessage::StartPingCheck(ping) => {
                match connection.on_ping_request(ping) {
                    Ok(pong) => self.send_datagrams(connection.remote_addr(), &[pong]).await,
                    Err(e) => warn!("{}: could not answer ping: {}", connection.id(), e),
                }
            }
            ControlMessage::CompletePingCheck(pong) => {
                connection.on_pong(pong.ping_id, now);
            }
            ControlMessage::AgentThrottle(throttle) => {
                let adjustment = connection.set_throttles(throttle.rates, now);
                let _ = self.events.send(TransportEvent::ThrottlesAdjusted {
                    connection_id: connection.id(),
                    adjustment,
                });
            }
            ControlMessage::CloseCircuit => {
                self.close_connection(connection, CloseReason::ProtocolClose);
            }
            ControlMessage::UseCircuitCode(_) => {
                trace!("{}: ignoring circuit setup request for established circuit", connection.id());
            }
        }
    }

    /// One pass of the outbound loop over all connections. Returns `true` if anything was sent.
    async fn tick(self: &Arc<Self>, now: Instant) -> bool {
        let connections = self.connections.by_addr.load();

        let mut sent_any = false;
        for connection in connections.values() {
            if connection.is_timed_out(now) {
                let engine = self.clone();
                let connection = connection.clone();
                tokio::spawn(async move {
                    if engine.close_connection(&connection, CloseReason::Timeout) {
                        warn!("{}: no packets received for {:?}", connection.id(), connection.liveness_timeout());
                    }
                });
                continue;
            }

            let output = connection.tick(now);
            for packet in &output.unacked_callbacks {
                if let Some(on_unacked) = &packet.on_unacked {
                    on_unacked(packet);
                }
            }
            self.stats.on_resent(output.resent);
            self.stats.on_dropped_unacked(output.dropped_unacked);
            if output.stalled {
                self.stats.on_ack_stall();
            }
            if !output.emptied.is_empty() {
                self.notify_queue_empty(connection, output.emptied, now);
            }
            if !output.datagrams.is_empty() {
                sent_any = true;
                self.send_datagrams(connection.remote_addr(), &output.datagrams).await;
            }
        }
        sent_any
    }

    fn notify_queue_empty(&self, connection: &Arc<Connection>, categories: Vec<ThrottleCategory>, now: Instant) {
        if !connection.try_begin_queue_empty(now) {
            return;
        }

        let handler = self.queue_empty_handler.clone();
        let c = connection.clone();
        let submitted = self.job_engine.try_submit(async move {
            if !c.is_closed() {
                handler.on_queue_empty(c.id(), categories).await;
            }
            c.queue_empty_done();
        });
        if !submitted {
            connection.queue_empty_done();
            self.stats.on_job_rejected();
        }
    }

    /// Closes a connection and removes it from the connection table. The 'closed' event is
    ///  emitted exactly once per connection, by the call that actually closed it.
    fn close_connection(&self, connection: &Arc<Connection>, reason: CloseReason) -> bool {
        if !connection.close(reason) {
            return false;
        }

        self.connections.remove(connection);
        self.stats.on_connection_closed();
        info!("closed circuit for agent {} at {:?}: {}", connection.id(), connection.remote_addr(), reason);
        let _ = self.events.send(TransportEvent::Closed {
            connection_id: connection.id(),
            remote_addr: connection.remote_addr(),
            reason,
        });
        true
    }

    async fn send_datagrams(&self, to: SocketAddr, datagrams: &[Bytes]) {
        for datagram in datagrams {
            self.socket.send_datagram(to, datagram).await;
        }
        self.stats.on_sent(datagrams.len());
    }
}
