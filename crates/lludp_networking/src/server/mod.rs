//! # Server Dispatcher
//!
//! Owns the UDP socket and every circuit of one simulator.
//!
//! ## Architecture
//!
//! ```text
//!  datagram ──> known address? ──yes──> Circuit::receive ──> route
//!                    │                                         ├─ CompleteAgentMovement ─> reply + region entry
//!                    no                                        ├─ ChatFromViewer ────────> ChatService
//!                    │                                         ├─ ImprovedInstantMessage > InstantMessageService
//!                    ▼                                         └─ other ─────────────────> InboundHandler / drop
//!            UseCircuitCode matching a pending circuit?
//!                    ├─ yes: bind, ack, start workers, RegionHandshake
//!                    └─ no:  drop silently
//! ```
//!
//! ## Design
//!
//! - Circuits are looked up by code, by remote address and by agent under
//!   one `RwLock`; binding an address is a single write
//! - Circuits report closure through a weak observer, so they never keep
//!   the server alive
//! - Worker threads are reaped by the socket loop and joined on shutdown

mod registry;
pub mod services;

pub use services::{
    ChatRequest, ChatService, InboundHandler, InstantMessage, InstantMessageService,
    NullServices, PresenceService, SceneView, Services,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lludp_core::{BufferPool, Clock, SystemClock};
use parking_lot::Mutex;
use uuid::Uuid;

use self::registry::{CircuitEntry, CircuitRegistry, ManualWorkers};
use crate::circuit::{
    Circuit, CircuitCode, CircuitIdentity, CircuitObserver, CircuitState, CloseReason,
};
use crate::config::{ServerConfig, WorkerMode};
use crate::error::{NetError, NetResult};
use crate::objects::{ObjectUpdateInfo, ObjectUpdateScheduler};
use crate::protocol::{self, Message};
use crate::scheduler::TransmitScheduler;
use crate::transport::{DatagramSink, UdpTransport};
use crate::MAX_PACKET_SIZE;

/// Interval between sweeps for expired pending circuits in [`LludpServer::run`].
const PENDING_SWEEP_MS: u64 = 1_000;

/// State shared by every clone of the server and by circuit observers.
struct ServerShared {
    config: ServerConfig,
    services: Services,
    sink: Arc<dyn DatagramSink>,
    clock: Arc<dyn Clock>,
    pool: Arc<BufferPool>,
    registry: CircuitRegistry,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Forwards circuit lifecycle events to the server, if it still exists.
struct RegistryObserver(Weak<ServerShared>);

impl CircuitObserver for RegistryObserver {
    fn logout_acknowledged(&self, identity: &CircuitIdentity) {
        if let Some(shared) = self.0.upgrade() {
            shared.services.presence.agent_logged_out(identity);
        }
    }

    fn circuit_closed(&self, identity: &CircuitIdentity, reason: CloseReason) {
        let Some(shared) = self.0.upgrade() else {
            return;
        };
        if let Some(entry) = shared.registry.remove(identity) {
            entry.updates.stop();
        }
        shared.services.presence.circuit_closed(identity, reason);
    }
}

/// The LLUDP simulator endpoint.
///
/// Cheap to clone; clones share the socket and the circuits.
#[derive(Clone)]
pub struct LludpServer {
    shared: Arc<ServerShared>,
    transport: Option<Arc<UdpTransport>>,
}

impl LludpServer {
    /// Binds the UDP socket and creates an idle server.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Io`] if the socket cannot be bound.
    pub fn bind(config: ServerConfig, services: Services) -> NetResult<Self> {
        let transport = Arc::new(UdpTransport::bind(
            config.bind_address,
            Duration::from_millis(config.recv_timeout_ms),
        )?);
        let sink: Arc<dyn DatagramSink> = transport.clone();
        let mut server = Self::with_sink(config, services, sink, Arc::new(SystemClock::new()));
        server.transport = Some(transport);
        Ok(server)
    }

    /// Creates a server that sends through `sink` and has no socket.
    ///
    /// Datagrams are fed in with [`handle_datagram`](Self::handle_datagram).
    ///
    /// # Arguments
    ///
    /// * `config` - Server configuration
    /// * `services` - Collaborators to route messages to
    /// * `sink` - Where outbound datagrams go
    /// * `clock` - Time source for every circuit
    #[must_use]
    pub fn with_sink(
        config: ServerConfig,
        services: Services,
        sink: Arc<dyn DatagramSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pool = Arc::new(BufferPool::new(config.packet_pool_size));
        Self {
            shared: Arc::new(ServerShared {
                config,
                services,
                sink,
                clock,
                pool,
                registry: CircuitRegistry::default(),
                running: AtomicBool::new(true),
                workers: Mutex::new(Vec::new()),
            }),
            transport: None,
        }
    }

    /// Socket address, if bound.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(|t| t.local_addr())
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Buffer pool shared by all circuits.
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.shared.pool
    }

    /// Whether [`shutdown`](Self::shutdown) has not been called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Registered circuits, pending or active.
    #[must_use]
    pub fn circuit_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Circuits bound to a remote address.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.registry.bound_len()
    }

    /// Looks a circuit up by code.
    #[must_use]
    pub fn circuit(&self, code: CircuitCode) -> Option<Arc<Circuit>> {
        self.shared.registry.by_code(code).map(|e| e.circuit.clone())
    }

    /// Looks a circuit up by agent.
    #[must_use]
    pub fn circuit_for_agent(&self, agent_id: &Uuid) -> Option<Arc<Circuit>> {
        self.shared
            .registry
            .by_agent(agent_id)
            .map(|e| e.circuit.clone())
    }

    /// Announces a circuit the login flow has authorized.
    ///
    /// The circuit stays `Pending` until a matching `UseCircuitCode` arrives.
    /// Registering a code again replaces (and closes) the earlier circuit.
    pub fn register_pending(
        &self,
        code: CircuitCode,
        session_id: Uuid,
        agent_id: Uuid,
    ) -> Arc<Circuit> {
        let shared = &self.shared;
        let observer = Arc::new(RegistryObserver(Arc::downgrade(shared)));
        let circuit = Arc::new(Circuit::new(
            CircuitIdentity {
                code,
                session_id,
                agent_id,
            },
            shared.config.circuit.clone(),
            shared.clock.clone(),
            shared.pool.clone(),
            observer,
        ));

        if let Some(previous) = shared.registry.by_code(code) {
            tracing::warn!(code, "circuit code registered twice, closing the older one");
            previous.updates.stop();
            previous.circuit.close(CloseReason::Shutdown);
        }
        if let Some(stale) = shared
            .registry
            .insert(Arc::new(CircuitEntry::new(circuit.clone())))
        {
            stale.updates.stop();
        }
        tracing::debug!(code, %agent_id, "circuit registered");
        circuit
    }

    /// Processes one inbound datagram from `addr`.
    pub fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        match self.shared.registry.by_addr(&addr) {
            Some(entry) => self.dispatch(&entry, data),
            None => self.admit(data, addr),
        }
    }

    fn admit(&self, data: &[u8], addr: SocketAddr) {
        let packet = match protocol::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "undecodable datagram from unknown address");
                return;
            }
        };
        let Message::UseCircuitCode {
            code,
            session_id,
            agent_id,
        } = &packet.message
        else {
            tracing::debug!(%addr, message = packet.message.name(), "datagram from unknown address dropped");
            return;
        };
        let Some(entry) = self
            .shared
            .registry
            .bind(*code, session_id, agent_id, addr)
        else {
            tracing::debug!(%addr, code, "handshake does not match a pending circuit");
            return;
        };

        if packet.is_reliable() {
            self.ack_now(&entry.circuit, packet.sequence, addr);
        }
        if let Err(e) = self.start_workers(&entry) {
            tracing::error!(code, error = %e, "failed to start circuit workers");
            entry.updates.stop();
            entry.circuit.close(CloseReason::Shutdown);
            return;
        }

        let region = &self.shared.config.region;
        let handshake = Message::RegionHandshake {
            region_flags: region.flags,
            sim_access: region.sim_access,
            region_name: region.name.clone(),
            region_id: region.region_id,
        };
        if entry.circuit.send(handshake).is_err() {
            tracing::debug!(code, "circuit closed during handshake");
        }
    }

    /// Acks the handshake straight away, ahead of the transmit worker.
    fn ack_now(&self, circuit: &Circuit, sequence: u32, addr: SocketAddr) {
        let ack = Message::PacketAck {
            sequences: vec![sequence],
        };
        let sent = protocol::encode_to_vec(&ack, circuit.next_sequence(), false, &[]).and_then(
            |frame| {
                self.shared
                    .sink
                    .send_to(&frame, addr)
                    .map_err(NetError::from)
            },
        );
        if let Err(e) = sent {
            tracing::debug!(code = circuit.code(), error = %e, "handshake ack failed");
        }
    }

    fn start_workers(&self, entry: &CircuitEntry) -> std::io::Result<()> {
        let shared = &self.shared;
        let transmit = TransmitScheduler::new(
            entry.circuit.clone(),
            shared.sink.clone(),
            shared.services.stats.clone(),
            shared.config.region.clone(),
        );
        let updates = ObjectUpdateScheduler::new(
            entry.circuit.clone(),
            entry.updates.clone(),
            shared.config.region.handle,
        );

        match shared.config.worker_mode {
            WorkerMode::Threaded => {
                let tx = transmit.spawn()?;
                let obj = match updates.spawn() {
                    Ok(handle) => handle,
                    Err(e) => {
                        shared.workers.lock().push(tx);
                        return Err(e);
                    }
                };
                shared.workers.lock().extend([tx, obj]);
            }
            WorkerMode::Manual => {
                *entry.manual.lock() = Some(ManualWorkers { transmit, updates });
            }
        }
        Ok(())
    }

    fn dispatch(&self, entry: &CircuitEntry, data: &[u8]) {
        match entry.circuit.receive(data) {
            Ok(Some(message)) => self.route(entry, message),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(code = entry.circuit.code(), error = %e, "dropping bad packet");
            }
        }
    }

    fn route(&self, entry: &CircuitEntry, message: Message) {
        let identity = *entry.circuit.identity();
        match message {
            Message::CompleteAgentMovement { session_id, .. }
                if session_id == identity.session_id =>
            {
                let reply = Message::AgentMovementComplete {
                    agent_id: identity.agent_id,
                    session_id: identity.session_id,
                    region_handle: self.shared.config.region.handle,
                    timestamp: unix_time(),
                };
                if entry.circuit.send(reply).is_ok() && entry.mark_entered() {
                    self.on_region_entry(entry);
                }
            }
            Message::ChatFromViewer {
                session_id,
                message,
                chat_type,
                channel,
                ..
            } if session_id == identity.session_id => {
                self.shared.services.chat.chat_from_viewer(ChatRequest {
                    from: identity,
                    message,
                    chat_type,
                    channel,
                });
            }
            Message::ImprovedInstantMessage {
                session_id,
                to_agent_id,
                dialog,
                from_name,
                message,
                ..
            } if session_id == identity.session_id => {
                self.shared
                    .services
                    .instant_messages
                    .instant_message(InstantMessage {
                        from: identity,
                        to_agent_id,
                        dialog,
                        from_name,
                        message,
                    });
            }
            Message::CompleteAgentMovement { .. }
            | Message::ChatFromViewer { .. }
            | Message::ImprovedInstantMessage { .. } => {
                tracing::debug!(code = identity.code, "session id mismatch, message dropped");
            }
            Message::UseCircuitCode { .. } => {
                tracing::debug!(code = identity.code, "repeated handshake ignored");
            }
            other => match &self.shared.services.inbound {
                Some(handler) => handler.handle(&identity, other),
                None => tracing::debug!(
                    code = identity.code,
                    message = other.name(),
                    "no handler, message dropped"
                ),
            },
        }
    }

    /// First update: tells everyone else about this avatar and queues the
    /// whole scene for the newcomer.
    fn on_region_entry(&self, entry: &CircuitEntry) {
        let shared = &self.shared;
        let identity = entry.circuit.identity();
        tracing::info!(code = identity.code, agent = %identity.agent_id, "agent entered region");

        if let Some(avatar) = shared.services.scene.avatar(&identity.agent_id) {
            for other in shared.registry.entries() {
                if other.circuit.code() != identity.code && other.circuit.is_active() {
                    other.updates.add_schedule_update(avatar.clone());
                }
            }
        }
        for info in shared.services.scene.entities() {
            entry.updates.add_schedule_update(info);
        }
    }

    /// Queues a message for an agent.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::UnknownCircuit`] if the agent has no circuit, or
    /// [`NetError::CircuitClosed`] if it is shutting down.
    pub fn send_message(&self, agent_id: &Uuid, message: Message) -> NetResult<()> {
        let entry = self
            .shared
            .registry
            .by_agent(agent_id)
            .ok_or(NetError::UnknownCircuit)?;
        entry.circuit.send(message)
    }

    /// Schedules an entity change for one agent.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::UnknownCircuit`] if the agent has no circuit.
    pub fn schedule_update(&self, agent_id: &Uuid, info: ObjectUpdateInfo) -> NetResult<()> {
        let entry = self
            .shared
            .registry
            .by_agent(agent_id)
            .ok_or(NetError::UnknownCircuit)?;
        entry.updates.add_schedule_update(info);
        Ok(())
    }

    /// Schedules an entity change for every active circuit.
    ///
    /// Returns the number of circuits it was queued for.
    pub fn broadcast_update(&self, info: &ObjectUpdateInfo) -> usize {
        let mut queued = 0;
        for entry in self.shared.registry.entries() {
            if entry.circuit.is_active() {
                entry.updates.add_schedule_update(info.clone());
                queued += 1;
            }
        }
        queued
    }

    /// Runs one pass of every manually driven circuit, then expires pending
    /// circuits whose handshake deadline has passed.
    ///
    /// Returns the number of circuits visited. Worker passes do nothing for
    /// threaded circuits.
    pub fn pump(&self) -> usize {
        let entries = self.shared.registry.entries();
        for entry in &entries {
            entry.pump();
        }
        self.expire_pending();
        entries.len()
    }

    /// Closes pre-registered circuits that never saw `UseCircuitCode` within
    /// the handshake timeout. Closure removes them from the registry.
    ///
    /// Returns the number of circuits closed.
    pub fn expire_pending(&self) -> usize {
        let now = self.shared.clock.now_ms();
        self.shared
            .registry
            .entries()
            .iter()
            .filter(|entry| entry.circuit.state() == CircuitState::Pending)
            .filter(|entry| entry.circuit.check_timeouts(now).is_some())
            .count()
    }

    /// Receives and dispatches datagrams until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`NetError::NotConnected`] for a server without a socket, or
    /// the socket error that stopped the loop.
    pub fn run(&self) -> NetResult<()> {
        let transport = self.transport.as_ref().ok_or(NetError::NotConnected)?;
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let mut next_sweep_ms = self.shared.clock.now_ms() + PENDING_SWEEP_MS;
        tracing::info!(addr = %transport.local_addr(), "server loop started");

        while self.is_running() {
            match transport.recv_from(&mut buffer) {
                Ok(Some((len, addr))) => self.handle_datagram(&buffer[..len], addr),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "socket failed, stopping server loop");
                    self.shared.running.store(false, Ordering::Release);
                    return Err(e.into());
                }
            }
            if self.shared.config.worker_mode == WorkerMode::Manual {
                self.pump();
            } else {
                let now = self.shared.clock.now_ms();
                if now >= next_sweep_ms {
                    next_sweep_ms = now + PENDING_SWEEP_MS;
                    self.expire_pending();
                }
            }
            self.reap_workers();
        }

        tracing::info!("server loop stopped");
        Ok(())
    }

    fn reap_workers(&self) {
        let finished: Vec<JoinHandle<()>> = {
            let mut workers = self.shared.workers.lock();
            let (done, live): (Vec<_>, Vec<_>) =
                workers.drain(..).partition(JoinHandle::is_finished);
            *workers = live;
            done
        };
        for handle in finished {
            if handle.join().is_err() {
                tracing::error!("circuit worker panicked");
            }
        }
    }

    /// Stops the loop, closes every circuit and joins every worker.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        for entry in self.shared.registry.entries() {
            entry.updates.stop();
            entry.circuit.close(CloseReason::Shutdown);
        }
        let workers = std::mem::take(&mut *self.shared.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("circuit worker panicked");
            }
        }
        tracing::info!("server shut down");
    }
}

impl std::fmt::Debug for LludpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LludpServer")
            .field("local_addr", &self.local_addr())
            .field("circuits", &self.circuit_count())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}
