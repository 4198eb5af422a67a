//! # Throttle
//!
//! Leaky token bucket limiting a circuit's outbound byte rate, plus the
//! per-category rates a viewer requests with `AgentThrottle`.
//!
//! ## Model
//!
//! Each send adds its size to the bucket level. The level drains linearly with
//! elapsed time at the configured rate, never slower than the floor rate. The
//! circuit may send while the level is below the burst capacity. The level is
//! unsigned and drains with saturating arithmetic, so it cannot go negative for
//! any elapsed time.

use crate::protocol::THROTTLE_CATEGORIES;

/// Smallest burst capacity: two full frames, so one send never locks the bucket.
const MIN_BURST: u64 = 2 * crate::MAX_PACKET_SIZE as u64;

/// Token bucket owned by one transmit scheduler.
#[derive(Clone, Debug)]
pub struct ThrottleBucket {
    /// Configured drain rate, bytes per second.
    rate: u64,
    /// Drain floor, bytes per second.
    min_drain: u64,
    /// Bytes currently in the bucket.
    level: u64,
    /// Level at which sending pauses.
    capacity: u64,
    /// Clock reading of the last decay.
    last_decay_ms: u64,
}

impl ThrottleBucket {
    /// Creates an empty bucket.
    ///
    /// # Arguments
    ///
    /// * `rate` - Bytes per second
    /// * `min_drain` - Floor of the drain rate, bytes per second
    /// * `now_ms` - Current clock reading
    #[must_use]
    pub fn new(rate: u64, min_drain: u64, now_ms: u64) -> Self {
        Self {
            rate,
            min_drain,
            level: 0,
            capacity: Self::burst_for(rate),
            last_decay_ms: now_ms,
        }
    }

    fn burst_for(rate: u64) -> u64 {
        (rate / 4).max(MIN_BURST)
    }

    /// Drains the bucket for the time since the last decay.
    pub fn decay(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_decay_ms);
        self.last_decay_ms = self.last_decay_ms.max(now_ms);
        self.decay_by(elapsed);
    }

    /// Drains the bucket for `elapsed_ms` milliseconds.
    pub fn decay_by(&mut self, elapsed_ms: u64) {
        let per_second = self.rate.max(self.min_drain);
        let drained = per_second.saturating_mul(elapsed_ms) / 1000;
        self.level = self.level.saturating_sub(drained);
    }

    /// Whether another packet may be sent now.
    #[inline]
    #[must_use]
    pub const fn has_headroom(&self) -> bool {
        self.level < self.capacity
    }

    /// Records `bytes` sent.
    #[inline]
    pub fn consume(&mut self, bytes: usize) {
        self.level = self.level.saturating_add(bytes as u64);
    }

    /// Reconfigures the drain rate and burst capacity.
    pub fn set_rate(&mut self, rate: u64) {
        self.rate = rate;
        self.capacity = Self::burst_for(rate);
    }

    /// Current drain rate, bytes per second.
    #[inline]
    #[must_use]
    pub const fn rate(&self) -> u64 {
        self.rate
    }

    /// Bytes currently in the bucket.
    #[inline]
    #[must_use]
    pub const fn level(&self) -> u64 {
        self.level
    }

    /// Burst capacity.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Per-category rates from an `AgentThrottle` message.
///
/// Categories, in wire order: resend, land, wind, cloud, task, texture, asset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThrottleRates {
    /// Bits per second per category, sanitized to finite non-negative values.
    pub bits_per_second: [f32; THROTTLE_CATEGORIES],
}

impl ThrottleRates {
    /// Wraps raw viewer values. NaN, infinite and negative entries become 0.
    #[must_use]
    pub fn from_bits_per_second(raw: [f32; THROTTLE_CATEGORIES]) -> Self {
        let mut bits_per_second = raw;
        for value in &mut bits_per_second {
            if !value.is_finite() || *value < 0.0 {
                *value = 0.0;
            }
        }
        Self { bits_per_second }
    }

    /// Total byte rate, clamped to `[min, max]`.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn total_bytes_per_second(&self, min: u64, max: u64) -> u64 {
        let bits: f64 = self.bits_per_second.iter().map(|v| f64::from(*v)).sum();
        let bytes = (bits / 8.0).min(max as f64) as u64;
        bytes.clamp(min, max)
    }
}
