//! # Object Update Scheduler
//!
//! Turns entity change records into `ObjectUpdate`,
//! `ImprovedTerseObjectUpdate` and `KillObject` messages for one viewer.
//!
//! ## Design
//!
//! - Producers (the world model, any thread) push into an
//!   [`ObjectUpdateQueue`]; only the newest record per entity is kept
//! - Physics-active entities are served before everything else; within a
//!   lane entities go out in the order they were first queued
//! - The scheduler remembers the last serial sent per entity: an unchanged
//!   serial means only motion changed and a terse block is enough
//! - Every message stays within [`MTU_BUDGET`](crate::MTU_BUDGET) of payload

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::update::{patch_permissions, ObjectUpdateInfo};
use crate::circuit::Circuit;
use crate::protocol::Message;
use crate::{MAX_KILLS_PER_PACKET, MTU_BUDGET};

/// Message id, region handle, time dilation and block count.
const UPDATE_HEADER_LEN: usize = 12;

/// Message id and block count.
const KILL_HEADER_LEN: usize = 2;

/// Blocks per update message (count is a single byte).
const MAX_BLOCKS: usize = 255;

/// Terse blocks carry a one-byte length.
const MAX_TERSE_BLOCK: usize = 255;

/// Reported when the world model gives no dilation.
const FULL_SPEED_DILATION: u16 = u16::MAX;

/// How long an idle scheduler thread sleeps before re-checking shutdown.
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Pending {
    entries: HashMap<u32, ObjectUpdateInfo>,
    physics: VecDeque<u32>,
    other: VecDeque<u32>,
}

/// Thread-safe inbox of entity changes for one viewer.
pub struct ObjectUpdateQueue {
    pending: Mutex<Pending>,
    wake: Condvar,
    running: AtomicBool,
}

impl Default for ObjectUpdateQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectUpdateQueue {
    /// Creates an empty, running queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
        }
    }

    /// Queues a change, replacing any unsent change for the same entity.
    ///
    /// A replaced entry keeps its place in line. Changes arriving after
    /// [`stop`](Self::stop) are dropped.
    pub fn add_schedule_update(&self, info: ObjectUpdateInfo) {
        if !self.is_running() {
            return;
        }
        let mut pending = self.pending.lock();
        let local_id = info.local_id;
        let physical = info.physical;
        if pending.entries.insert(local_id, info).is_none() {
            if physical {
                pending.physics.push_back(local_id);
            } else {
                pending.other.push_back(local_id);
            }
        }
        drop(pending);
        self.wake.notify_one();
    }

    /// Number of entities with unsent changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().entries.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue still accepts changes.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the queue and wakes any waiting worker.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake.notify_all();
    }

    /// Blocks until work arrives, the timeout passes, or the queue stops.
    ///
    /// Returns whether the queue is still running.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if pending.entries.is_empty() && self.is_running() {
            let _ = self.wake.wait_for(&mut pending, timeout);
        }
        self.is_running()
    }

    /// Takes every pending change: physics lane first, then the rest.
    pub fn take_batch(&self) -> Vec<ObjectUpdateInfo> {
        let mut pending = self.pending.lock();
        let Pending {
            entries,
            physics,
            other,
        } = &mut *pending;
        let mut batch = Vec::with_capacity(entries.len());
        for local_id in physics.drain(..).chain(other.drain(..)) {
            if let Some(info) = entries.remove(&local_id) {
                batch.push(info);
            }
        }
        batch
    }
}

impl std::fmt::Debug for ObjectUpdateQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectUpdateQueue")
            .field("pending", &self.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Packs blocks into groups whose encoded payload fits the MTU budget.
struct Packer<T> {
    header: usize,
    length_prefix: usize,
    size: usize,
    blocks: Vec<T>,
    groups: Vec<Vec<T>>,
}

impl<T: AsRef<[u8]>> Packer<T> {
    fn new(header: usize, length_prefix: usize) -> Self {
        Self {
            header,
            length_prefix,
            size: header,
            blocks: Vec::new(),
            groups: Vec::new(),
        }
    }

    /// Adds a block. Returns false if the block can never fit.
    fn push(&mut self, block: T) -> bool {
        let cost = self.length_prefix + block.as_ref().len();
        if self.header + cost > MTU_BUDGET {
            return false;
        }
        if self.size + cost > MTU_BUDGET || self.blocks.len() == MAX_BLOCKS {
            self.flush();
        }
        self.size += cost;
        self.blocks.push(block);
        true
    }

    fn flush(&mut self) {
        if !self.blocks.is_empty() {
            self.groups.push(std::mem::take(&mut self.blocks));
        }
        self.size = self.header;
    }

    fn finish(mut self) -> Vec<Vec<T>> {
        self.flush();
        self.groups
    }
}

/// Per-viewer update worker.
pub struct ObjectUpdateScheduler {
    circuit: Arc<Circuit>,
    queue: Arc<ObjectUpdateQueue>,
    region_handle: u64,
    last_serial: BTreeMap<u32, u32>,
}

impl ObjectUpdateScheduler {
    /// Creates a scheduler draining `queue` into `circuit`.
    #[must_use]
    pub fn new(circuit: Arc<Circuit>, queue: Arc<ObjectUpdateQueue>, region_handle: u64) -> Self {
        Self {
            circuit,
            queue,
            region_handle,
            last_serial: BTreeMap::new(),
        }
    }

    /// The queue producers push into.
    #[must_use]
    pub fn queue(&self) -> &Arc<ObjectUpdateQueue> {
        &self.queue
    }

    /// Last serial sent for an entity, if the viewer has seen it.
    #[must_use]
    pub fn last_serial(&self, local_id: u32) -> Option<u32> {
        self.last_serial.get(&local_id).copied()
    }

    /// Encodes a batch into messages: full updates, then terse, then kills.
    pub fn build_messages(&mut self, batch: Vec<ObjectUpdateInfo>) -> Vec<Message> {
        let viewer = self.circuit.identity().agent_id;
        let mut full = Packer::<Vec<u8>>::new(UPDATE_HEADER_LEN, 2);
        let mut terse = Packer::<Arc<[u8]>>::new(UPDATE_HEADER_LEN, 1);
        let mut kills: Vec<u32> = Vec::new();

        for info in batch {
            if info.killed {
                self.last_serial.remove(&info.local_id);
                kills.push(info.local_id);
                continue;
            }

            let seen = self.last_serial.insert(info.local_id, info.serial);
            if seen == Some(info.serial) {
                if info.terse.len() > MAX_TERSE_BLOCK || !terse.push(info.terse.clone()) {
                    tracing::warn!(
                        local_id = info.local_id,
                        len = info.terse.len(),
                        "terse update block too large, dropped"
                    );
                }
                continue;
            }

            let mut block = info.full.to_vec();
            patch_permissions(&mut block, &info, &viewer);
            let len = block.len();
            if !full.push(block) {
                // Let the next change retry a full update.
                self.last_serial.remove(&info.local_id);
                tracing::warn!(
                    local_id = info.local_id,
                    len,
                    "full update block too large, dropped"
                );
            }
        }

        let region_handle = self.region_handle;
        let mut messages: Vec<Message> = full
            .finish()
            .into_iter()
            .map(|blocks| Message::ObjectUpdate {
                region_handle,
                time_dilation: FULL_SPEED_DILATION,
                blocks,
            })
            .collect();
        messages.extend(terse.finish().into_iter().map(|blocks| {
            Message::ImprovedTerseObjectUpdate {
                region_handle,
                time_dilation: FULL_SPEED_DILATION,
                blocks,
            }
        }));
        messages.extend(kills.chunks(MAX_KILLS_PER_PACKET).map(|ids| {
            debug_assert!(KILL_HEADER_LEN + 4 * ids.len() <= MTU_BUDGET);
            Message::KillObject {
                local_ids: ids.to_vec(),
            }
        }));
        messages
    }

    /// Drains the queue once and hands the messages to the circuit.
    ///
    /// Returns the number of messages queued for transmission.
    pub fn run_pass(&mut self) -> usize {
        let batch = self.queue.take_batch();
        if batch.is_empty() {
            return 0;
        }
        let mut sent = 0;
        for message in self.build_messages(batch) {
            if self.circuit.send(message).is_err() {
                self.queue.stop();
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be created.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("lludp-obj-{}", self.circuit.code()))
            .spawn(move || self.run())
    }

    /// Runs until the queue is stopped or the circuit closes.
    pub fn run(mut self) {
        tracing::debug!(code = self.circuit.code(), "object update scheduler started");
        while self.queue.wait(IDLE_WAIT) {
            if self.circuit.is_closing() {
                self.queue.stop();
                break;
            }
            self.run_pass();
        }
        tracing::debug!(code = self.circuit.code(), "object update scheduler stopped");
    }
}

impl std::fmt::Debug for ObjectUpdateScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectUpdateScheduler")
            .field("code", &self.circuit.code())
            .field("known", &self.last_serial.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitIdentity, CircuitObserver, CloseReason, Outbound};
    use crate::config::CircuitConfig;
    use crate::objects::update::{block_flags, encode_full_block, ObjectPermissions, PrimFlags};
    use crate::protocol::{encode_to_vec, MessageId};
    use lludp_core::{BufferPool, ManualClock};
    use uuid::Uuid;

    const VIEWER: Uuid = Uuid::from_u128(0x77);

    struct Quiet;

    impl CircuitObserver for Quiet {
        fn circuit_closed(&self, _identity: &CircuitIdentity, _reason: CloseReason) {}
    }

    fn scheduler() -> ObjectUpdateScheduler {
        let circuit = Circuit::new(
            CircuitIdentity {
                code: 5,
                session_id: Uuid::from_u128(0x66),
                agent_id: VIEWER,
            },
            CircuitConfig::default(),
            Arc::new(ManualClock::new(0)),
            Arc::new(BufferPool::new(8)),
            Arc::new(Quiet),
        );
        ObjectUpdateScheduler::new(Arc::new(circuit), Arc::new(ObjectUpdateQueue::new()), 99)
    }

    fn entity(local_id: u32, serial: u32, body_len: usize) -> ObjectUpdateInfo {
        ObjectUpdateInfo {
            local_id,
            owner_id: VIEWER,
            killed: false,
            physical: false,
            serial,
            full: encode_full_block(local_id, PrimFlags::empty(), &VIEWER, &vec![0; body_len]),
            terse: Arc::from(vec![local_id as u8; 44]),
            permissions: ObjectPermissions::default(),
        }
    }

    fn sent_messages(scheduler: &ObjectUpdateScheduler) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(item) = scheduler.circuit.outbound_receiver().try_recv() {
            if let Outbound::Message(m) = item {
                out.push(m.message);
            }
        }
        out
    }

    #[test]
    fn test_newer_change_replaces_in_place() {
        let queue = ObjectUpdateQueue::new();
        queue.add_schedule_update(entity(1, 1, 10));
        queue.add_schedule_update(entity(2, 1, 10));
        queue.add_schedule_update(entity(1, 2, 10));

        let batch = queue.take_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].local_id, 1);
        assert_eq!(batch[0].serial, 2);
        assert_eq!(batch[1].local_id, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_physics_lane_first() {
        let queue = ObjectUpdateQueue::new();
        queue.add_schedule_update(entity(1, 1, 10));
        let mut moving = entity(2, 1, 10);
        moving.physical = true;
        queue.add_schedule_update(moving);

        let order: Vec<u32> = queue.take_batch().iter().map(|i| i.local_id).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn test_stopped_queue_drops_changes() {
        let queue = ObjectUpdateQueue::new();
        queue.stop();
        queue.add_schedule_update(entity(1, 1, 10));
        assert!(queue.is_empty());
        assert!(!queue.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_full_then_terse_by_serial() {
        let mut scheduler = scheduler();
        let first = scheduler.build_messages(vec![entity(1, 7, 10)]);
        assert!(matches!(&first[..], [Message::ObjectUpdate { blocks, .. }] if blocks.len() == 1));

        let second = scheduler.build_messages(vec![entity(1, 7, 10)]);
        assert!(matches!(
            &second[..],
            [Message::ImprovedTerseObjectUpdate { blocks, .. }] if blocks.len() == 1
        ));

        let third = scheduler.build_messages(vec![entity(1, 8, 10)]);
        assert!(matches!(&third[..], [Message::ObjectUpdate { .. }]));
        assert_eq!(scheduler.last_serial(1), Some(8));
    }

    #[test]
    fn test_full_blocks_patched_for_viewer() {
        let mut scheduler = scheduler();
        let messages = scheduler.build_messages(vec![entity(1, 1, 10)]);
        let Message::ObjectUpdate { blocks, .. } = &messages[0] else {
            panic!("expected a full update");
        };
        let flags = block_flags(&blocks[0]).unwrap();
        assert!(flags.contains(PrimFlags::OBJECT_YOU_OWNER | PrimFlags::OBJECT_ANY_OWNER));
    }

    #[test]
    fn test_kill_forgets_serial_and_goes_last() {
        let mut scheduler = scheduler();
        scheduler.build_messages(vec![entity(3, 1, 10)]);

        let messages = scheduler.build_messages(vec![
            ObjectUpdateInfo::killed(3),
            entity(4, 1, 10),
        ]);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], Message::ObjectUpdate { .. }));
        assert_eq!(
            messages[1],
            Message::KillObject {
                local_ids: vec![3]
            }
        );
        assert_eq!(scheduler.last_serial(3), None);

        let again = scheduler.build_messages(vec![entity(3, 1, 10)]);
        assert!(matches!(&again[..], [Message::ObjectUpdate { .. }]));
    }

    #[test]
    fn test_kills_batched() {
        let mut scheduler = scheduler();
        let batch = (0..600).map(ObjectUpdateInfo::killed).collect();
        let messages = scheduler.build_messages(batch);
        let sizes: Vec<usize> = messages
            .iter()
            .map(|m| match m {
                Message::KillObject { local_ids } => local_ids.len(),
                other => panic!("unexpected {}", other.name()),
            })
            .collect();
        assert_eq!(sizes, vec![250, 250, 100]);
    }

    #[test]
    fn test_every_message_within_budget() {
        let mut scheduler = scheduler();
        let batch: Vec<_> = (0..200).map(|id| entity(id, 1, 180)).collect();
        let full = scheduler.build_messages(batch);
        assert!(full.len() > 1);

        let batch: Vec<_> = (0..200).map(|id| entity(id, 1, 180)).collect();
        let terse = scheduler.build_messages(batch);
        assert!(terse
            .iter()
            .all(|m| matches!(m, Message::ImprovedTerseObjectUpdate { .. })));

        for message in full.iter().chain(&terse) {
            let mut body = crate::protocol::PacketWriter::new();
            message.encode(&mut body);
            assert!(body.len() <= MTU_BUDGET, "{} is {} bytes", message.name(), body.len());
            assert!(encode_to_vec(message, 1, true, &[]).is_ok());
        }
    }

    #[test]
    fn test_oversized_block_dropped() {
        let mut scheduler = scheduler();
        let messages = scheduler.build_messages(vec![entity(1, 1, MTU_BUDGET), entity(2, 1, 10)]);
        assert_eq!(messages.len(), 1);
        let Message::ObjectUpdate { blocks, .. } = &messages[0] else {
            panic!("expected a full update");
        };
        assert_eq!(blocks.len(), 1);
        assert_eq!(scheduler.last_serial(1), None);

        let mut fat = entity(3, 1, 10);
        fat.terse = Arc::from(vec![0u8; 300]);
        scheduler.build_messages(vec![fat.clone()]);
        assert!(scheduler.build_messages(vec![fat]).is_empty());
    }

    #[test]
    fn test_run_pass_sends_via_circuit() {
        let mut scheduler = scheduler();
        let queue = scheduler.queue().clone();
        queue.add_schedule_update(entity(1, 1, 10));
        queue.add_schedule_update(ObjectUpdateInfo::killed(9));

        assert_eq!(scheduler.run_pass(), 2);
        let ids: Vec<MessageId> = sent_messages(&scheduler).iter().map(Message::id).collect();
        assert_eq!(ids, vec![MessageId::OBJECT_UPDATE, MessageId::KILL_OBJECT]);
        assert_eq!(scheduler.run_pass(), 0);
    }

    #[test]
    fn test_worker_exits_on_stop() {
        let scheduler = scheduler();
        let queue = scheduler.queue().clone();
        let handle = scheduler.spawn().unwrap();
        queue.add_schedule_update(entity(1, 1, 10));
        queue.stop();
        handle.join().unwrap();
    }
}
