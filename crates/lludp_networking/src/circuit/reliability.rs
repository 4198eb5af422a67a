//! Unacked-packet table and inbound duplicate window.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

use lludp_core::PacketBuffer;

/// Callback fired once when a reliable packet is acknowledged.
pub type AckCallback = Box<dyn FnOnce(u32) + Send>;

/// A reliable packet awaiting acknowledgment.
pub struct UnackedPacket {
    /// The datagram exactly as sent.
    pub buffer: PacketBuffer,
    /// Clock reading of the last (re)transmission.
    pub sent_ms: u64,
    /// Retransmissions so far.
    pub resend_count: u32,
    /// Completion callback.
    pub on_acked: Option<AckCallback>,
}

impl std::fmt::Debug for UnackedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnackedPacket")
            .field("len", &self.buffer.len())
            .field("sent_ms", &self.sent_ms)
            .field("resend_count", &self.resend_count)
            .finish_non_exhaustive()
    }
}

/// Reliable packets keyed by sequence number.
#[derive(Debug, Default)]
pub struct UnackedTable {
    packets: HashMap<u32, UnackedPacket>,
}

impl UnackedTable {
    /// Records a sent packet, returning the stored entry.
    ///
    /// A stale entry under the same sequence (after wraparound) is returned
    /// in the second slot so its buffer can go back to the pool.
    pub fn insert(
        &mut self,
        sequence: u32,
        packet: UnackedPacket,
    ) -> (&UnackedPacket, Option<UnackedPacket>) {
        match self.packets.entry(sequence) {
            Entry::Occupied(mut slot) => {
                let stale = slot.insert(packet);
                (slot.into_mut(), Some(stale))
            }
            Entry::Vacant(slot) => (slot.insert(packet), None),
        }
    }

    /// Removes a packet; `None` for unknown sequences.
    pub fn remove(&mut self, sequence: u32) -> Option<UnackedPacket> {
        self.packets.remove(&sequence)
    }

    /// Looks up a packet for retransmission.
    pub fn get_mut(&mut self, sequence: u32) -> Option<&mut UnackedPacket> {
        self.packets.get_mut(&sequence)
    }

    /// Marks every packet older than `resend_after_ms` and still under the
    /// cap as resent now, returning their sequence numbers in ascending order.
    pub fn collect_expired(&mut self, now_ms: u64, resend_after_ms: u64, max_resends: u32) -> Vec<u32> {
        let mut due: Vec<u32> = self
            .packets
            .iter_mut()
            .filter(|(_, p)| {
                now_ms.saturating_sub(p.sent_ms) > resend_after_ms && p.resend_count < max_resends
            })
            .map(|(seq, p)| {
                p.resend_count += 1;
                p.sent_ms = now_ms;
                *seq
            })
            .collect();
        due.sort_unstable();
        due
    }

    /// Smallest sequence still unacknowledged.
    #[must_use]
    pub fn oldest(&self) -> Option<u32> {
        self.packets.keys().min().copied()
    }

    /// Number of packets waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Empties the table.
    pub fn drain(&mut self) -> impl Iterator<Item = UnackedPacket> + '_ {
        self.packets.drain().map(|(_, p)| p)
    }
}

/// Remembers the most recent reliable inbound sequence numbers.
#[derive(Debug)]
pub struct DuplicateWindow {
    order: VecDeque<u32>,
    seen: HashSet<u32>,
    capacity: usize,
}

impl DuplicateWindow {
    /// Default window size.
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Creates a window holding `capacity` sequence numbers.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Records `sequence`; returns true if it was already in the window.
    pub fn observe(&mut self, sequence: u32) -> bool {
        if self.seen.contains(&sequence) {
            return true;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(sequence);
        self.seen.insert(sequence);
        false
    }
}

impl Default for DuplicateWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
