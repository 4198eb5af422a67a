//! Outbound latency pings.

use std::collections::BTreeMap;

/// Outstanding pings kept before the oldest is evicted.
pub const MAX_OUTSTANDING_PINGS: usize = 16;

/// Ping intervals without an answer before a new ping is sent anyway.
pub const ABANDON_AFTER_INTERVALS: u64 = 3;

/// Tracks `StartPingCheck` pings until the peer echoes them.
///
/// Pings are keyed by a monotonically increasing counter so map order is
/// send order; the wire id is the counter's low byte.
#[derive(Debug, Default)]
pub struct PingTracker {
    outstanding: BTreeMap<u64, u64>,
    next_counter: u64,
    last_sent_ms: Option<u64>,
    last_answered: bool,
}

impl PingTracker {
    /// Whether a new ping may go out: the last one was answered, or it has
    /// been abandoned for [`ABANDON_AFTER_INTERVALS`] intervals.
    #[must_use]
    pub fn should_ping(&self, now_ms: u64, interval_ms: u64) -> bool {
        match self.last_sent_ms {
            None => true,
            Some(sent) => {
                self.last_answered
                    || now_ms.saturating_sub(sent) >= interval_ms * ABANDON_AFTER_INTERVALS
            }
        }
    }

    /// Registers a new ping and returns its wire id.
    pub fn start(&mut self, now_ms: u64) -> u8 {
        let counter = self.next_counter;
        self.next_counter = self.next_counter.wrapping_add(1);
        self.outstanding.insert(counter, now_ms);
        while self.outstanding.len() > MAX_OUTSTANDING_PINGS {
            self.outstanding.pop_first();
        }
        self.last_sent_ms = Some(now_ms);
        self.last_answered = false;
        counter as u8
    }

    /// Matches an echo; returns the round-trip time if the id is outstanding.
    pub fn complete(&mut self, ping_id: u8, now_ms: u64) -> Option<u64> {
        let counter = *self
            .outstanding
            .keys()
            .rev()
            .find(|counter| **counter as u8 == ping_id)?;
        let sent = self.outstanding.remove(&counter)?;
        if counter.wrapping_add(1) == self.next_counter {
            self.last_answered = true;
        }
        Some(now_ms.saturating_sub(sent))
    }

    /// Number of unanswered pings.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}
