//! # Circuit
//!
//! One viewer connection: identity, sequence numbers, reliability state,
//! liveness and teardown.
//!
//! ## Design
//!
//! - The receive path (dispatcher thread) and the transmit path (the circuit's
//!   scheduler thread) share a `Circuit` through an `Arc`
//! - Everything both paths touch is an atomic, a `parking_lot::Mutex`, or a
//!   crossbeam channel
//! - Socket writes happen only on the transmit path; the receive path queues
//!   replies and resends into the outbound channel
//!
//! ## Lifecycle
//!
//! ```text
//! Pending ──(UseCircuitCode)──> Active ──(timeout / logout / close)──> Terminating ──> Closed
//! ```

mod ping;
mod reliability;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{unbounded, Receiver, Sender};
use lludp_core::{BufferPool, Clock, PacketBuffer, BUFFER_SIZE};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::CircuitConfig;
use crate::error::{NetError, NetResult};
use crate::protocol::{self, Message};
use crate::throttle::ThrottleRates;
use crate::transport::DatagramSink;

pub use ping::{PingTracker, MAX_OUTSTANDING_PINGS};
pub use reliability::{AckCallback, DuplicateWindow, UnackedPacket, UnackedTable};

/// Circuit code assigned by the login flow.
pub type CircuitCode = u32;

/// Lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CircuitState {
    /// Registered by the login flow, waiting for `UseCircuitCode`.
    Pending = 0,
    /// Handshake done; loops running.
    Active = 1,
    /// Teardown in progress.
    Terminating = 2,
    /// Torn down.
    Closed = 3,
}

impl CircuitState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Active,
            2 => Self::Terminating,
            _ => Self::Closed,
        }
    }
}

/// Why a circuit was torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// No inbound traffic within the inactivity timeout.
    InactivityTimeout,
    /// The peer acknowledged our `LogoutReply`.
    LogoutAcknowledged,
    /// The peer never acknowledged our `LogoutReply`.
    LogoutTimeout,
    /// The peer sent `CloseCircuit`.
    ClosedByRemote,
    /// `UseCircuitCode` never arrived for a pre-registered circuit.
    HandshakeTimeout,
    /// Server shutdown or explicit removal.
    Shutdown,
}

/// Who a circuit belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CircuitIdentity {
    /// Circuit code.
    pub code: CircuitCode,
    /// Session id issued at login.
    pub session_id: Uuid,
    /// Agent id.
    pub agent_id: Uuid,
}

/// Receives lifecycle notifications, keyed by circuit identity.
pub trait CircuitObserver: Send + Sync {
    /// The peer acknowledged our `LogoutReply`. Runs before closure.
    fn logout_acknowledged(&self, _identity: &CircuitIdentity) {}

    /// The circuit has closed. Runs exactly once per circuit.
    fn circuit_closed(&self, identity: &CircuitIdentity, reason: CloseReason);
}

/// A message handed to a circuit for delivery.
pub struct OutboundMessage {
    /// The message.
    pub message: Message,
    /// Whether to track it for acknowledgment.
    pub reliable: bool,
    /// Fired once with the sequence number when acknowledged.
    pub on_acked: Option<AckCallback>,
}

impl OutboundMessage {
    /// Wraps a message with its default reliability.
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            reliable: message.is_reliable_by_default(),
            message,
            on_acked: None,
        }
    }

    /// Overrides reliability.
    #[must_use]
    pub fn reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    /// Attaches an acknowledgment callback. Implies reliable delivery.
    #[must_use]
    pub fn on_acked(mut self, callback: impl FnOnce(u32) + Send + 'static) -> Self {
        self.reliable = true;
        self.on_acked = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("message", &self.message.name())
            .field("reliable", &self.reliable)
            .field("on_acked", &self.on_acked.is_some())
            .finish()
    }
}

/// Work items for the transmit scheduler.
#[derive(Debug)]
pub enum Outbound {
    /// Send a message.
    Message(OutboundMessage),
    /// Retransmit the unacked packet with this sequence number.
    Resend(u32),
    /// Reconfigure the throttle.
    Throttle(ThrottleRates),
    /// Stop the scheduler.
    Shutdown,
}

/// Per-circuit packet counters.
#[derive(Debug, Default)]
pub struct CircuitCounters {
    /// Datagrams received.
    pub packets_in: AtomicU64,
    /// Datagrams sent, including resends.
    pub packets_out: AtomicU64,
    /// Retransmissions.
    pub packets_resent: AtomicU64,
    /// Inbound duplicates suppressed.
    pub duplicates: AtomicU64,
    /// Bytes sent.
    pub bytes_out: AtomicU64,
}

#[derive(Debug, Default)]
struct LogoutState {
    reply_sequence: Option<u32>,
    reply_sent_ms: Option<u64>,
}

/// One viewer connection.
pub struct Circuit {
    identity: CircuitIdentity,
    config: CircuitConfig,
    state: AtomicU8,
    remote: OnceLock<SocketAddr>,
    next_sequence: AtomicU32,
    last_inbound_ms: AtomicU64,
    unacked: Mutex<UnackedTable>,
    unacked_bytes: AtomicUsize,
    pending_acks: (Sender<u32>, Receiver<u32>),
    outbound: (Sender<Outbound>, Receiver<Outbound>),
    pings: Mutex<PingTracker>,
    last_rtt_ms: AtomicU64,
    duplicates: Mutex<DuplicateWindow>,
    logout: Mutex<LogoutState>,
    throttle_generation: Mutex<Option<u32>>,
    counters: CircuitCounters,
    clock: Arc<dyn Clock>,
    pool: Arc<BufferPool>,
    observer: Arc<dyn CircuitObserver>,
}

impl Circuit {
    /// Creates a `Pending` circuit.
    ///
    /// # Arguments
    ///
    /// * `identity` - Code, session and agent from the login flow
    /// * `config` - Timeouts and resend limits
    /// * `clock` - Time source for every timeout
    /// * `pool` - Shared packet buffers
    /// * `observer` - Notified on logout and closure
    #[must_use]
    pub fn new(
        identity: CircuitIdentity,
        config: CircuitConfig,
        clock: Arc<dyn Clock>,
        pool: Arc<BufferPool>,
        observer: Arc<dyn CircuitObserver>,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            identity,
            config,
            state: AtomicU8::new(CircuitState::Pending as u8),
            remote: OnceLock::new(),
            next_sequence: AtomicU32::new(1),
            last_inbound_ms: AtomicU64::new(now),
            unacked: Mutex::new(UnackedTable::default()),
            unacked_bytes: AtomicUsize::new(0),
            pending_acks: unbounded(),
            outbound: unbounded(),
            pings: Mutex::new(PingTracker::default()),
            last_rtt_ms: AtomicU64::new(0),
            duplicates: Mutex::new(DuplicateWindow::default()),
            logout: Mutex::new(LogoutState::default()),
            throttle_generation: Mutex::new(None),
            counters: CircuitCounters::default(),
            clock,
            pool,
            observer,
        }
    }

    /// Returns the identity.
    #[inline]
    #[must_use]
    pub const fn identity(&self) -> &CircuitIdentity {
        &self.identity
    }

    /// Returns the circuit code.
    #[inline]
    #[must_use]
    pub const fn code(&self) -> CircuitCode {
        self.identity.code
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the handshake completed and the circuit is not closing.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == CircuitState::Active
    }

    /// Whether the circuit is past `Active`.
    #[inline]
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.state() >= CircuitState::Terminating
    }

    /// Returns the bound remote address, if the handshake has happened.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote.get().copied()
    }

    /// Returns the clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the packet pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Returns the packet counters.
    #[must_use]
    pub const fn counters(&self) -> &CircuitCounters {
        &self.counters
    }

    /// Bytes sent reliably and not yet acknowledged.
    #[must_use]
    pub fn unacked_bytes(&self) -> usize {
        self.unacked_bytes.load(Ordering::Acquire)
    }

    /// Number of packets in the unacked table.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().len()
    }

    /// Round-trip time of the last answered ping, in milliseconds.
    #[must_use]
    pub fn last_rtt_ms(&self) -> u64 {
        self.last_rtt_ms.load(Ordering::Relaxed)
    }

    /// Clock reading of the last inbound datagram.
    #[must_use]
    pub fn last_inbound_ms(&self) -> u64 {
        self.last_inbound_ms.load(Ordering::Acquire)
    }

    /// Binds the remote address and moves `Pending` to `Active`.
    ///
    /// Returns false if the circuit was not `Pending`.
    pub fn activate(&self, addr: SocketAddr) -> bool {
        if self
            .state
            .compare_exchange(
                CircuitState::Pending as u8,
                CircuitState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        // First and only bind; the CAS above admits one caller.
        let _ = self.remote.set(addr);
        self.last_inbound_ms.store(self.clock.now_ms(), Ordering::Release);
        tracing::info!(
            code = self.identity.code,
            agent = %self.identity.agent_id,
            %addr,
            "circuit active"
        );
        true
    }

    /// Queues a message with its default reliability.
    ///
    /// # Errors
    ///
    /// Returns `CircuitClosed` once teardown has started.
    pub fn send(&self, message: Message) -> NetResult<()> {
        self.send_with(OutboundMessage::new(message))
    }

    /// Queues a message with explicit delivery options.
    ///
    /// # Errors
    ///
    /// Returns `CircuitClosed` once teardown has started.
    pub fn send_with(&self, message: OutboundMessage) -> NetResult<()> {
        if self.is_closing() {
            return Err(NetError::CircuitClosed(self.identity.code));
        }
        self.outbound
            .0
            .send(Outbound::Message(message))
            .map_err(|_| NetError::CircuitClosed(self.identity.code))
    }

    /// The transmit scheduler's work queue.
    #[must_use]
    pub fn outbound_receiver(&self) -> &Receiver<Outbound> {
        &self.outbound.1
    }

    /// Sequence numbers of reliable inbound packets awaiting our ack.
    #[must_use]
    pub fn pending_acks(&self) -> &Receiver<u32> {
        &self.pending_acks.1
    }

    /// Allocates the next outbound sequence number.
    #[inline]
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence.fetch_add(1, Ordering::AcqRel)
    }

    /// Takes a packet buffer from the shared pool.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::PoolExhausted`] when every buffer is in use; the
    /// caller keeps its message queued and retries later.
    pub fn acquire_buffer(&self) -> NetResult<PacketBuffer> {
        self.pool.try_acquire().ok_or(NetError::PoolExhausted)
    }

    /// Smallest sequence we still wait on, or the next one to be allocated.
    #[must_use]
    pub fn oldest_unacked(&self) -> u32 {
        self.unacked
            .lock()
            .oldest()
            .unwrap_or_else(|| self.next_sequence.load(Ordering::Acquire))
    }

    /// Writes a framed packet to the socket, tracking it if reliable.
    ///
    /// The buffer goes into the unacked table or back to the pool. Returns the
    /// number of bytes handed to the sink.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` before the handshake, or the socket error.
    pub fn transmit(
        &self,
        sink: &dyn DatagramSink,
        sequence: u32,
        buffer: PacketBuffer,
        reliable: bool,
        on_acked: Option<AckCallback>,
    ) -> NetResult<usize> {
        let Some(addr) = self.remote_addr() else {
            self.pool.release(buffer);
            return Err(NetError::NotConnected);
        };
        let len = buffer.len();

        if !reliable {
            let result = sink.send_to(buffer.as_slice(), addr);
            self.pool.release(buffer);
            return self.count_sent(result);
        }

        // Insert first, write after the lock is released.
        let mut frame = [0u8; BUFFER_SIZE];
        frame[..len].copy_from_slice(buffer.as_slice());
        let mut table = self.unacked.lock();
        if self.is_closing() {
            drop(table);
            self.pool.release(buffer);
            return Err(NetError::CircuitClosed(self.identity.code));
        }
        let (_, stale) = table.insert(
            sequence,
            UnackedPacket {
                buffer,
                sent_ms: self.clock.now_ms(),
                resend_count: 0,
                on_acked,
            },
        );
        self.unacked_bytes.fetch_add(len, Ordering::AcqRel);
        drop(table);
        if let Some(stale) = stale {
            self.unacked_bytes
                .fetch_sub(stale.buffer.len(), Ordering::AcqRel);
            self.pool.release(stale.buffer);
        }

        self.count_sent(sink.send_to(&frame[..len], addr))
    }

    /// Retransmits an unacked packet as-is with the resent flag set.
    ///
    /// Returns `Ok(0)` if it was acknowledged in the meantime.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` before the handshake, or the socket error.
    pub fn retransmit(&self, sink: &dyn DatagramSink, sequence: u32) -> NetResult<usize> {
        let addr = self.remote_addr().ok_or(NetError::NotConnected)?;
        let mut frame = [0u8; BUFFER_SIZE];
        let len = {
            let mut table = self.unacked.lock();
            let Some(entry) = table.get_mut(sequence) else {
                return Ok(0);
            };
            protocol::mark_resent(&mut entry.buffer);
            let len = entry.buffer.len();
            frame[..len].copy_from_slice(entry.buffer.as_slice());
            len
        };

        self.counters.packets_resent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(code = self.identity.code, sequence, "resent packet");
        self.count_sent(sink.send_to(&frame[..len], addr))
    }

    fn count_sent(&self, result: std::io::Result<usize>) -> NetResult<usize> {
        let sent = result?;
        self.counters.packets_out.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_out.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(sent)
    }

    /// Processes an acknowledgment. Unknown sequences are ignored.
    ///
    /// Returns true if a packet was removed.
    pub fn acknowledge(&self, sequence: u32) -> bool {
        let Some(packet) = self.unacked.lock().remove(sequence) else {
            return false;
        };
        self.unacked_bytes
            .fetch_sub(packet.buffer.len(), Ordering::AcqRel);
        self.pool.release(packet.buffer);
        if let Some(callback) = packet.on_acked {
            callback(sequence);
        }

        let is_logout_reply = self.logout.lock().reply_sequence == Some(sequence);
        if is_logout_reply {
            self.observer.logout_acknowledged(&self.identity);
            self.close(CloseReason::LogoutAcknowledged);
        }
        true
    }

    /// Records the sequence of an outgoing `LogoutReply` and starts the
    /// logout-ack timer.
    pub fn note_logout_reply(&self, sequence: u32, now_ms: u64) {
        let mut logout = self.logout.lock();
        logout.reply_sequence = Some(sequence);
        logout.reply_sent_ms = Some(now_ms);
    }

    /// Decodes and handles one inbound datagram.
    ///
    /// Acks, pings, throttle changes, logout and `CloseCircuit` are handled
    /// here. Anything else is returned for the dispatcher to route. Duplicate
    /// reliable packets are acked again and return `None`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` for undecodable input and `CircuitClosed`
    /// after teardown. Neither affects the circuit.
    pub fn receive(&self, data: &[u8]) -> NetResult<Option<Message>> {
        if self.is_closing() {
            return Err(NetError::CircuitClosed(self.identity.code));
        }
        let packet = protocol::decode(data)?;
        let now = self.clock.now_ms();
        self.last_inbound_ms.store(now, Ordering::Release);
        self.counters.packets_in.fetch_add(1, Ordering::Relaxed);

        for ack in &packet.acks {
            self.acknowledge(*ack);
        }

        if packet.is_reliable() {
            // Receiver lives in self, so the channel cannot disconnect.
            let _ = self.pending_acks.0.send(packet.sequence);
            if self.duplicates.lock().observe(packet.sequence) {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    code = self.identity.code,
                    sequence = packet.sequence,
                    "duplicate suppressed"
                );
                return Ok(None);
            }
        }

        match packet.message {
            Message::PacketAck { sequences } => {
                for sequence in sequences {
                    self.acknowledge(sequence);
                }
                Ok(None)
            }
            Message::StartPingCheck { ping_id, .. } => {
                self.queue(Outbound::Message(OutboundMessage::new(
                    Message::CompletePingCheck { ping_id },
                )));
                self.resend_expired(now);
                Ok(None)
            }
            Message::CompletePingCheck { ping_id } => {
                if let Some(rtt) = self.pings.lock().complete(ping_id, now) {
                    self.last_rtt_ms.store(rtt, Ordering::Relaxed);
                }
                Ok(None)
            }
            Message::AgentThrottle {
                gen_counter,
                throttles,
                ..
            } => {
                let mut generation = self.throttle_generation.lock();
                if generation.is_some_and(|last| gen_counter < last) {
                    tracing::debug!(code = self.identity.code, gen_counter, "stale throttle");
                } else {
                    *generation = Some(gen_counter);
                    drop(generation);
                    self.queue(Outbound::Throttle(ThrottleRates::from_bits_per_second(
                        throttles,
                    )));
                }
                Ok(None)
            }
            Message::LogoutRequest { .. } => {
                tracing::info!(code = self.identity.code, "logout requested");
                self.queue(Outbound::Message(OutboundMessage::new(Message::LogoutReply {
                    agent_id: self.identity.agent_id,
                    session_id: self.identity.session_id,
                })));
                Ok(None)
            }
            Message::CloseCircuit => {
                self.close(CloseReason::ClosedByRemote);
                Ok(None)
            }
            other => Ok(Some(other)),
        }
    }

    fn queue(&self, item: Outbound) {
        // Receiver lives in self, so the channel cannot disconnect.
        let _ = self.outbound.0.send(item);
    }

    /// Queues retransmission of every packet older than the resend delay
    /// and still under the resend cap.
    ///
    /// Returns the number of packets queued.
    pub fn resend_expired(&self, now_ms: u64) -> usize {
        let due = self.unacked.lock().collect_expired(
            now_ms,
            self.config.resend_after_ms,
            self.config.max_resends,
        );
        for sequence in &due {
            self.queue(Outbound::Resend(*sequence));
        }
        due.len()
    }

    /// Builds a `StartPingCheck` if a ping is due.
    pub fn start_ping(&self, now_ms: u64) -> Option<Message> {
        let mut pings = self.pings.lock();
        if !pings.should_ping(now_ms, self.config.ping_interval_ms) {
            return None;
        }
        let ping_id = pings.start(now_ms);
        drop(pings);
        Some(Message::StartPingCheck {
            ping_id,
            oldest_unacked: self.oldest_unacked(),
        })
    }

    /// Closes the circuit if a timeout has elapsed.
    ///
    /// A `Pending` circuit expires once the handshake deadline passes; an
    /// `Active` one on silence or an unacknowledged logout.
    pub fn check_timeouts(&self, now_ms: u64) -> Option<CloseReason> {
        let silent = now_ms.saturating_sub(self.last_inbound_ms());
        match self.state() {
            CircuitState::Active => {}
            CircuitState::Pending if silent > self.config.handshake_timeout_ms => {
                tracing::warn!(code = self.identity.code, "handshake never arrived");
                return self
                    .close(CloseReason::HandshakeTimeout)
                    .then_some(CloseReason::HandshakeTimeout);
            }
            _ => return None,
        }
        if silent > self.config.inactivity_timeout_ms {
            tracing::warn!(code = self.identity.code, silent_ms = silent, "circuit timed out");
            return self
                .close(CloseReason::InactivityTimeout)
                .then_some(CloseReason::InactivityTimeout);
        }
        let logout_sent = self.logout.lock().reply_sent_ms;
        if let Some(sent) = logout_sent {
            if now_ms.saturating_sub(sent) > self.config.logout_ack_timeout_ms {
                tracing::warn!(code = self.identity.code, "logout reply never acknowledged");
                return self
                    .close(CloseReason::LogoutTimeout)
                    .then_some(CloseReason::LogoutTimeout);
            }
        }
        None
    }

    /// Tears the circuit down. Only the first call has any effect.
    ///
    /// Stops the transmit scheduler, returns every unacked buffer to the pool
    /// and notifies the observer. Returns true for the call that closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= CircuitState::Terminating as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                CircuitState::Terminating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.queue(Outbound::Shutdown);

        let mut table = self.unacked.lock();
        for packet in table.drain() {
            self.pool.release(packet.buffer);
        }
        self.unacked_bytes.store(0, Ordering::Release);
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        drop(table);

        tracing::info!(code = self.identity.code, ?reason, "circuit closed");
        self.observer.circuit_closed(&self.identity, reason);
        true
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        for packet in self.unacked.get_mut().drain() {
            self.pool.release(packet.buffer);
        }
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("remote", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_to_vec, PacketEncoder};
    use lludp_core::ManualClock;
    use std::io;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl DatagramSink for Recorder {
        fn send_to(&self, data: &[u8], _addr: SocketAddr) -> io::Result<usize> {
            self.sent.lock().push(data.to_vec());
            Ok(data.len())
        }
    }

    #[derive(Default)]
    struct Closures {
        closed: Mutex<Vec<CloseReason>>,
        logouts: AtomicUsize,
    }

    impl CircuitObserver for Closures {
        fn logout_acknowledged(&self, _identity: &CircuitIdentity) {
            self.logouts.fetch_add(1, Ordering::SeqCst);
        }

        fn circuit_closed(&self, _identity: &CircuitIdentity, reason: CloseReason) {
            self.closed.lock().push(reason);
        }
    }

    struct Fixture {
        circuit: Circuit,
        clock: Arc<ManualClock>,
        pool: Arc<BufferPool>,
        observer: Arc<Closures>,
        sink: Recorder,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(0));
        let pool = Arc::new(BufferPool::new(16));
        let observer = Arc::new(Closures::default());
        let circuit = Circuit::new(
            CircuitIdentity {
                code: 42,
                session_id: Uuid::from_u128(1),
                agent_id: Uuid::from_u128(2),
            },
            CircuitConfig::default(),
            clock.clone(),
            pool.clone(),
            observer.clone(),
        );
        assert!(circuit.activate("127.0.0.1:5000".parse().unwrap()));
        Fixture {
            circuit,
            clock,
            pool,
            observer,
            sink: Recorder::default(),
        }
    }

    fn send_reliable(f: &Fixture, message: &Message) -> u32 {
        let seq = f.circuit.next_sequence();
        let mut buffer = f.pool.try_acquire().unwrap();
        PacketEncoder::new()
            .encode(message, seq, true, &mut buffer)
            .unwrap();
        f.circuit.transmit(&f.sink, seq, buffer, true, None).unwrap();
        seq
    }

    fn drain_outbound(circuit: &Circuit) -> Vec<Outbound> {
        circuit.outbound_receiver().try_iter().collect()
    }

    #[test]
    fn test_sequence_starts_at_one_and_increases() {
        let f = fixture();
        assert_eq!(f.circuit.next_sequence(), 1);
        assert_eq!(f.circuit.next_sequence(), 2);
        assert_eq!(f.circuit.next_sequence(), 3);
    }

    #[test]
    fn test_activate_only_once() {
        let f = fixture();
        assert!(!f.circuit.activate("10.0.0.1:1".parse().unwrap()));
        assert_eq!(f.circuit.remote_addr().unwrap().port(), 5000);
    }

    #[test]
    fn test_ack_is_idempotent() {
        let f = fixture();
        let seq = send_reliable(&f, &Message::KillObject { local_ids: vec![1] });
        let bytes = f.circuit.unacked_bytes();
        assert!(bytes > 0);
        assert_eq!(f.pool.in_use(), 1);

        assert!(f.circuit.acknowledge(seq));
        assert_eq!(f.circuit.unacked_bytes(), 0);
        assert_eq!(f.pool.in_use(), 0);

        assert!(!f.circuit.acknowledge(seq));
        assert!(!f.circuit.acknowledge(9_999));
        assert_eq!(f.circuit.unacked_bytes(), 0);
        assert_eq!(f.circuit.unacked_count(), 0);
    }

    #[test]
    fn test_ack_callback_fires_once() {
        let f = fixture();
        let fired = Arc::new(AtomicUsize::new(0));
        let seq = f.circuit.next_sequence();
        let mut buffer = f.pool.try_acquire().unwrap();
        PacketEncoder::new()
            .encode(&Message::CloseCircuit, seq, true, &mut buffer)
            .unwrap();
        let counter = fired.clone();
        f.circuit
            .transmit(
                &f.sink,
                seq,
                buffer,
                true,
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        f.circuit.acknowledge(seq);
        f.circuit.acknowledge(seq);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_piggybacked_and_dedicated_acks() {
        let f = fixture();
        let a = send_reliable(&f, &Message::CloseCircuit);
        let b = send_reliable(&f, &Message::CloseCircuit);

        let inbound = encode_to_vec(&Message::PacketAck { sequences: vec![b] }, 1, false, &[a])
            .unwrap();
        assert_eq!(f.circuit.receive(&inbound).unwrap(), None);
        assert_eq!(f.circuit.unacked_count(), 0);
    }

    #[test]
    fn test_ping_triggers_resend_scan() {
        let f = fixture();
        let seq = send_reliable(&f, &Message::KillObject { local_ids: vec![5] });

        f.clock.advance(1_001);
        let ping = encode_to_vec(
            &Message::StartPingCheck {
                ping_id: 9,
                oldest_unacked: 0,
            },
            1,
            false,
            &[],
        )
        .unwrap();
        assert_eq!(f.circuit.receive(&ping).unwrap(), None);

        let queued = drain_outbound(&f.circuit);
        assert!(matches!(
            &queued[0],
            Outbound::Message(m) if m.message == Message::CompletePingCheck { ping_id: 9 }
        ));
        assert!(matches!(queued[1], Outbound::Resend(s) if s == seq));

        f.circuit.retransmit(&f.sink, seq).unwrap();
        let resent = f.sink.sent.lock().last().cloned().unwrap();
        let packet = protocol::decode(&resent).unwrap();
        assert!(packet.is_resent());
        assert_eq!(packet.sequence, seq);
    }

    #[test]
    fn test_duplicate_reacked_not_delivered() {
        let f = fixture();
        let chat = Message::ChatFromViewer {
            agent_id: Uuid::from_u128(2),
            session_id: Uuid::from_u128(1),
            message: "hi".into(),
            chat_type: 1,
            channel: 0,
        };
        let bytes = encode_to_vec(&chat, 77, true, &[]).unwrap();

        assert_eq!(f.circuit.receive(&bytes).unwrap(), Some(chat));
        assert_eq!(f.circuit.receive(&bytes).unwrap(), None);

        let acks: Vec<u32> = f.circuit.pending_acks().try_iter().collect();
        assert_eq!(acks, vec![77, 77]);
        assert_eq!(f.circuit.counters().duplicates.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_malformed_packet_does_not_close() {
        let f = fixture();
        assert!(f.circuit.receive(&[0x10, 0, 0, 0, 1, 0, 1, 99]).is_err());
        assert_eq!(f.circuit.state(), CircuitState::Active);
    }

    #[test]
    fn test_inactivity_timeout() {
        let f = fixture();
        send_reliable(&f, &Message::CloseCircuit);

        f.clock.set(60_000);
        assert_eq!(f.circuit.check_timeouts(60_000), None);
        f.clock.set(60_001);
        assert_eq!(
            f.circuit.check_timeouts(60_001),
            Some(CloseReason::InactivityTimeout)
        );
        assert_eq!(f.circuit.state(), CircuitState::Closed);
        assert_eq!(f.pool.in_use(), 0);
        assert_eq!(*f.observer.closed.lock(), vec![CloseReason::InactivityTimeout]);
        assert!(matches!(
            drain_outbound(&f.circuit).last(),
            Some(Outbound::Shutdown)
        ));
    }

    #[test]
    fn test_logout_ack_closes() {
        let f = fixture();
        let seq = send_reliable(
            &f,
            &Message::LogoutReply {
                agent_id: Uuid::from_u128(2),
                session_id: Uuid::from_u128(1),
            },
        );
        f.circuit.note_logout_reply(seq, 0);
        f.circuit.acknowledge(seq);

        assert_eq!(f.observer.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(*f.observer.closed.lock(), vec![CloseReason::LogoutAcknowledged]);
    }

    #[test]
    fn test_logout_timeout() {
        let f = fixture();
        f.circuit.note_logout_reply(3, 1_000);
        assert_eq!(f.circuit.check_timeouts(11_000), None);
        assert_eq!(
            f.circuit.check_timeouts(11_001),
            Some(CloseReason::LogoutTimeout)
        );
    }

    #[test]
    fn test_logout_request_queues_reply() {
        let f = fixture();
        let request = encode_to_vec(
            &Message::LogoutRequest {
                agent_id: Uuid::from_u128(2),
                session_id: Uuid::from_u128(1),
            },
            4,
            true,
            &[],
        )
        .unwrap();
        assert_eq!(f.circuit.receive(&request).unwrap(), None);
        assert!(matches!(
            drain_outbound(&f.circuit).first(),
            Some(Outbound::Message(m)) if matches!(m.message, Message::LogoutReply { .. })
        ));
    }

    #[test]
    fn test_stale_throttle_ignored() {
        let f = fixture();
        let throttle = |gen_counter| {
            encode_to_vec(
                &Message::AgentThrottle {
                    agent_id: Uuid::nil(),
                    session_id: Uuid::nil(),
                    circuit_code: 42,
                    gen_counter,
                    throttles: [100_000.0; 7],
                },
                gen_counter,
                true,
                &[],
            )
            .unwrap()
        };
        f.circuit.receive(&throttle(5)).unwrap();
        f.circuit.receive(&throttle(4)).unwrap();
        f.circuit.receive(&throttle(6)).unwrap();

        let updates = drain_outbound(&f.circuit)
            .into_iter()
            .filter(|o| matches!(o, Outbound::Throttle(_)))
            .count();
        assert_eq!(updates, 2);
    }

    #[test]
    fn test_close_circuit_from_remote() {
        let f = fixture();
        let bytes = encode_to_vec(&Message::CloseCircuit, 1, false, &[]).unwrap();
        f.circuit.receive(&bytes).unwrap();
        assert_eq!(f.circuit.state(), CircuitState::Closed);
        assert!(f.circuit.send(Message::CloseCircuit).is_err());
        assert!(!f.circuit.close(CloseReason::Shutdown));
        assert_eq!(f.observer.closed.lock().len(), 1);
    }

    #[test]
    fn test_ping_round_trip() {
        let f = fixture();
        let Some(Message::StartPingCheck { ping_id, .. }) = f.circuit.start_ping(0) else {
            panic!("expected a ping");
        };
        assert!(f.circuit.start_ping(5_000).is_none());

        f.clock.set(140);
        let echo = encode_to_vec(&Message::CompletePingCheck { ping_id }, 2, false, &[]).unwrap();
        f.circuit.receive(&echo).unwrap();
        assert_eq!(f.circuit.last_rtt_ms(), 140);
        assert!(f.circuit.start_ping(5_000).is_some());
    }

    /// Sink that inspects the unacked table from inside the socket write.
    struct InspectingSink<'a> {
        circuit: &'a Circuit,
        ack_on_write: bool,
        table_free: Mutex<Vec<bool>>,
    }

    impl DatagramSink for InspectingSink<'_> {
        fn send_to(&self, data: &[u8], _addr: SocketAddr) -> io::Result<usize> {
            let free = self.circuit.unacked.try_lock().is_some();
            self.table_free.lock().push(free);
            if free && self.ack_on_write {
                let sequence = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
                self.circuit.acknowledge(sequence);
            }
            Ok(data.len())
        }
    }

    #[test]
    fn test_socket_write_does_not_hold_unacked_lock() {
        let f = fixture();
        let sink = InspectingSink {
            circuit: &f.circuit,
            ack_on_write: true,
            table_free: Mutex::new(Vec::new()),
        };

        let seq = f.circuit.next_sequence();
        let mut buffer = f.pool.try_acquire().unwrap();
        PacketEncoder::new()
            .encode(&Message::KillObject { local_ids: vec![1] }, seq, true, &mut buffer)
            .unwrap();
        f.circuit.transmit(&sink, seq, buffer, true, None).unwrap();

        // Tracked before the write, so an ack racing it is not lost.
        assert_eq!(f.circuit.unacked_count(), 0);
        assert_eq!(f.circuit.unacked_bytes(), 0);

        let resent = send_reliable(&f, &Message::KillObject { local_ids: vec![2] });
        assert!(f.circuit.retransmit(&sink, resent).unwrap() > 0);
        assert_eq!(f.circuit.unacked_count(), 0);

        assert_eq!(sink.table_free.lock().as_slice(), &[true, true]);
        assert_eq!(f.pool.in_use(), 0);
    }

    #[test]
    fn test_acquire_buffer_reports_exhaustion() {
        let f = fixture();
        let held: Vec<PacketBuffer> = (0..16)
            .map(|_| f.circuit.acquire_buffer().unwrap())
            .collect();
        assert!(matches!(
            f.circuit.acquire_buffer(),
            Err(NetError::PoolExhausted)
        ));

        for buffer in held {
            f.pool.release(buffer);
        }
        let buffer = f.circuit.acquire_buffer().unwrap();
        f.pool.release(buffer);
    }

    #[test]
    fn test_pending_circuit_expires() {
        let observer = Arc::new(Closures::default());
        let circuit = Circuit::new(
            CircuitIdentity {
                code: 7,
                session_id: Uuid::from_u128(1),
                agent_id: Uuid::from_u128(2),
            },
            CircuitConfig::default(),
            Arc::new(ManualClock::new(0)),
            Arc::new(BufferPool::new(4)),
            observer.clone(),
        );

        assert_eq!(circuit.check_timeouts(60_000), None);
        assert_eq!(circuit.state(), CircuitState::Pending);
        assert_eq!(
            circuit.check_timeouts(60_001),
            Some(CloseReason::HandshakeTimeout)
        );
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(
            observer.closed.lock().as_slice(),
            &[CloseReason::HandshakeTimeout]
        );
        assert!(!circuit.activate("127.0.0.1:5000".parse().unwrap()));
    }
}
