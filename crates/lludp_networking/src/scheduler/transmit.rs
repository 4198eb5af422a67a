//! # Transmit Scheduler
//!
//! The single writer for one circuit: drains its work queue into priority
//! classes, spends the throttle bucket in class order, piggybacks acks, and
//! runs the periodic housekeeping (ack flush, ping, stats, timeouts).
//!
//! ## Pass
//!
//! ```text
//! inbox ──> classes ──> decay bucket ──> queue SimStats when due
//!                                    ──> for class in SERVICE_ORDER:
//!                                          send up to `quantum` while headroom
//!                                    ──> ack flush / ping / timeouts
//! ```
//!
//! Between passes the worker blocks on its inbox: for [`BUSY_WAIT`] while
//! work is held back by the throttle or an empty packet pool, otherwise until
//! the next housekeeping deadline.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use lludp_core::PacketBuffer;

use super::queue::{OutboundQueueSet, QueueClass};
use super::stats::{stat_id, StatsSource};
use crate::circuit::{Circuit, Outbound, OutboundMessage};
use crate::config::RegionConfig;
use crate::error::NetResult;
use crate::protocol::{append_acks, Message, PacketEncoder};
use crate::throttle::ThrottleBucket;
use crate::transport::DatagramSink;
use crate::MAX_ACKS_PER_PACKET;

/// Longest wait while throttled with work queued.
const BUSY_WAIT: Duration = Duration::from_millis(10);

/// Longest idle wait, so timeouts are still evaluated on silent circuits.
const MAX_IDLE_WAIT_MS: u64 = 1_000;

/// Per-circuit outbound worker.
pub struct TransmitScheduler {
    circuit: Arc<Circuit>,
    sink: Arc<dyn DatagramSink>,
    stats: Arc<dyn StatsSource>,
    region: RegionConfig,
    queues: OutboundQueueSet,
    bucket: ThrottleBucket,
    encoder: PacketEncoder,
    acks: VecDeque<u32>,
    next_ack_flush_ms: u64,
    next_ping_ms: u64,
    next_stats_ms: u64,
    last_stats_sample: (u64, u64, u64),
    /// The last pass stopped early because the packet pool was empty.
    backpressured: bool,
    running: bool,
}

impl TransmitScheduler {
    /// Creates the scheduler for `circuit`.
    ///
    /// # Arguments
    ///
    /// * `circuit` - The circuit to drain
    /// * `sink` - Socket (or test recorder) to write to
    /// * `stats` - Telemetry for `SimStats`
    /// * `region` - Region identity reported in `SimStats`
    #[must_use]
    pub fn new(
        circuit: Arc<Circuit>,
        sink: Arc<dyn DatagramSink>,
        stats: Arc<dyn StatsSource>,
        region: RegionConfig,
    ) -> Self {
        let now = circuit.clock().now_ms();
        let config = circuit.config();
        let bucket = ThrottleBucket::new(config.default_throttle_bps, config.min_throttle_bps, now);
        let next_ack_flush_ms = now + config.ack_flush_interval_ms;
        let next_ping_ms = now + config.ping_interval_ms;
        let next_stats_ms = now + config.stats_interval_ms;
        Self {
            sink,
            stats,
            region,
            queues: OutboundQueueSet::new(),
            bucket,
            encoder: PacketEncoder::new(),
            acks: VecDeque::new(),
            next_ack_flush_ms,
            next_ping_ms,
            next_stats_ms,
            last_stats_sample: (0, 0, now),
            backpressured: false,
            running: true,
            circuit,
        }
    }

    /// Returns the circuit.
    #[must_use]
    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    /// Returns the throttle bucket.
    #[must_use]
    pub const fn bucket(&self) -> &ThrottleBucket {
        &self.bucket
    }

    /// Number of queued messages in a class.
    #[must_use]
    pub fn queued(&self, class: QueueClass) -> usize {
        self.queues.len_of(class)
    }

    /// Whether the scheduler is still accepting work.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be created.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("lludp-tx-{}", self.circuit.code()))
            .spawn(move || self.run())
    }

    /// Runs until shutdown or until the circuit closes.
    pub fn run(mut self) {
        tracing::debug!(code = self.circuit.code(), "transmit scheduler started");
        let inbox = self.circuit.outbound_receiver().clone();

        while self.running {
            let wait = self.next_wait();
            match inbox.recv_timeout(wait) {
                Ok(item) => self.accept(item),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.pass();
        }

        tracing::debug!(code = self.circuit.code(), "transmit scheduler stopped");
    }

    /// Drains pending work without blocking and runs one pass.
    ///
    /// Returns false once the scheduler has stopped. Used when circuits are
    /// driven by the owner instead of by threads.
    pub fn pump(&mut self) -> bool {
        if self.running {
            self.pass();
        }
        self.running
    }

    fn next_wait(&self) -> Duration {
        if !self.queues.is_empty() {
            return if self.bucket.has_headroom() && !self.backpressured {
                Duration::ZERO
            } else {
                BUSY_WAIT
            };
        }
        let now = self.circuit.clock().now_ms();
        let deadline = self
            .next_ack_flush_ms
            .min(self.next_ping_ms)
            .min(self.next_stats_ms);
        Duration::from_millis(deadline.saturating_sub(now).min(MAX_IDLE_WAIT_MS))
    }

    fn accept(&mut self, item: Outbound) {
        match item {
            Outbound::Message(message) => {
                self.queues.push(message);
            }
            Outbound::Resend(sequence) => self.queues.push_resend(sequence),
            Outbound::Throttle(rates) => {
                let config = self.circuit.config();
                let rate =
                    rates.total_bytes_per_second(config.min_throttle_bps, config.max_throttle_bps);
                tracing::debug!(code = self.circuit.code(), rate, "throttle updated");
                self.bucket.set_rate(rate);
            }
            Outbound::Shutdown => self.running = false,
        }
    }

    fn pass(&mut self) {
        let inbox = self.circuit.outbound_receiver().clone();
        while self.running {
            match inbox.try_recv() {
                Ok(item) => self.accept(item),
                Err(_) => break,
            }
        }
        if !self.running || self.circuit.is_closing() {
            self.running = false;
            return;
        }

        let now = self.circuit.clock().now_ms();
        self.bucket.decay(now);
        self.acks.extend(self.circuit.pending_acks().try_iter());
        self.queue_stats(now);

        self.backpressured = match self.service() {
            Ok(()) => false,
            Err(e) => {
                tracing::debug!(code = self.circuit.code(), error = %e, "deferring queued messages");
                true
            }
        };
        self.housekeeping(now);
    }

    fn service(&mut self) -> NetResult<()> {
        let quantum = self.circuit.config().class_quantum;
        for class in QueueClass::SERVICE_ORDER {
            let mut sent = 0;
            while sent < quantum && self.bucket.has_headroom() && self.queues.has(class) {
                if class == QueueClass::Resend {
                    if let Some(sequence) = self.queues.pop_resend() {
                        match self.circuit.retransmit(self.sink.as_ref(), sequence) {
                            Ok(bytes) => self.bucket.consume(bytes),
                            Err(e) => tracing::debug!(code = self.circuit.code(), error = %e, "resend failed"),
                        }
                    }
                } else {
                    let buffer = self.circuit.acquire_buffer()?;
                    let Some(message) = self.queues.pop(class) else {
                        self.circuit.pool().release(buffer);
                        break;
                    };
                    self.send_in(buffer, message);
                }
                sent += 1;
            }
        }
        Ok(())
    }

    /// Frames and writes one message outside the queues.
    fn send(&mut self, outbound: OutboundMessage) -> NetResult<usize> {
        let buffer = self.circuit.acquire_buffer()?;
        Ok(self.send_in(buffer, outbound))
    }

    /// Frames `outbound` into `buffer`, piggybacks pending acks unless it is a
    /// `PacketAck` itself, and writes it. Returns the bytes sent.
    fn send_in(&mut self, mut buffer: PacketBuffer, outbound: OutboundMessage) -> usize {
        let sequence = self.circuit.next_sequence();

        if let Err(e) = self
            .encoder
            .encode(&outbound.message, sequence, outbound.reliable, &mut buffer)
        {
            tracing::warn!(
                code = self.circuit.code(),
                message = outbound.message.name(),
                error = %e,
                "dropping unencodable message"
            );
            self.circuit.pool().release(buffer);
            return 0;
        }
        if !matches!(outbound.message, Message::PacketAck { .. }) {
            append_acks(&mut buffer, &mut self.acks);
        }

        if matches!(outbound.message, Message::LogoutReply { .. }) {
            self.circuit
                .note_logout_reply(sequence, self.circuit.clock().now_ms());
        }

        match self.circuit.transmit(
            self.sink.as_ref(),
            sequence,
            buffer,
            outbound.reliable,
            outbound.on_acked,
        ) {
            Ok(bytes) => {
                self.bucket.consume(bytes);
                bytes
            }
            Err(e) => {
                tracing::debug!(code = self.circuit.code(), error = %e, "send failed");
                0
            }
        }
    }

    fn queue_stats(&mut self, now: u64) {
        if now >= self.next_stats_ms {
            self.next_stats_ms = now + self.circuit.config().stats_interval_ms;
            let stats = self.sim_stats(now);
            self.queues.push(OutboundMessage::new(stats));
        }
    }

    /// Dedicated acks and pings bypass the headroom check; their bytes
    /// still count against the bucket.
    fn housekeeping(&mut self, now: u64) {
        let config = self.circuit.config();
        let (ack_flush_interval_ms, ping_interval_ms) =
            (config.ack_flush_interval_ms, config.ping_interval_ms);

        if now >= self.next_ack_flush_ms {
            self.next_ack_flush_ms = now + ack_flush_interval_ms;
            while !self.acks.is_empty() {
                let buffer = match self.circuit.acquire_buffer() {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        tracing::debug!(code = self.circuit.code(), error = %e, "ack flush deferred");
                        break;
                    }
                };
                let count = self.acks.len().min(MAX_ACKS_PER_PACKET);
                let sequences: Vec<u32> = self.acks.drain(..count).collect();
                self.send_in(buffer, OutboundMessage::new(Message::PacketAck { sequences }));
            }
        }

        if now >= self.next_ping_ms {
            self.next_ping_ms = now + ping_interval_ms;
            if let Some(ping) = self.circuit.start_ping(now) {
                if let Err(e) = self.send(OutboundMessage::new(ping)) {
                    tracing::debug!(code = self.circuit.code(), error = %e, "ping deferred");
                }
            }
        }

        if self.circuit.check_timeouts(now).is_some() {
            self.running = false;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn sim_stats(&mut self, now: u64) -> Message {
        let region = self.stats.region_stats();
        let counters = self.circuit.counters();
        let packets_in = counters.packets_in.load(std::sync::atomic::Ordering::Relaxed);
        let packets_out = counters.packets_out.load(std::sync::atomic::Ordering::Relaxed);

        let (last_in, last_out, last_ms) = self.last_stats_sample;
        let elapsed_s = (now.saturating_sub(last_ms).max(1)) as f32 / 1000.0;
        let in_rate = packets_in.saturating_sub(last_in) as f32 / elapsed_s;
        let out_rate = packets_out.saturating_sub(last_out) as f32 / elapsed_s;
        self.last_stats_sample = (packets_in, packets_out, now);

        Message::SimStats {
            region_x: self.region.grid_x(),
            region_y: self.region.grid_y(),
            region_flags: self.region.flags,
            object_capacity: self.region.object_capacity,
            stats: vec![
                (stat_id::TIME_DILATION, region.time_dilation),
                (stat_id::SIM_FPS, region.sim_fps),
                (stat_id::PHYSICS_FPS, region.physics_fps),
                (stat_id::AGENT_UPDATES, region.agent_updates_per_sec),
                (stat_id::TOTAL_OBJECTS, region.object_count as f32),
                (stat_id::IN_PACKETS_PER_SEC, in_rate),
                (stat_id::OUT_PACKETS_PER_SEC, out_rate),
                (stat_id::PENDING_DOWNLOADS, region.pending_downloads as f32),
                (stat_id::PENDING_UPLOADS, region.pending_uploads as f32),
                (stat_id::UNACKED_BYTES, self.circuit.unacked_bytes() as f32),
            ],
        }
    }
}

impl std::fmt::Debug for TransmitScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmitScheduler")
            .field("circuit", &self.circuit.code())
            .field("queues", &self.queues)
            .field("bucket", &self.bucket)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}
