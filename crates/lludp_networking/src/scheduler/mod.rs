//! # Outbound Scheduling
//!
//! Per-circuit prioritized, throttled sending.
//!
//! ## Design
//!
//! - One [`TransmitScheduler`] per circuit, running on its own thread (or
//!   pumped by the owner in manual mode)
//! - The scheduler alone owns its queues and throttle bucket
//! - Messages route to exactly one [`QueueClass`] by an immutable table

mod queue;
mod stats;
mod transmit;

pub use queue::{OutboundQueueSet, QueueClass};
pub use stats::{stat_id, IdleStats, RegionStats, StatsSource};
pub use transmit::TransmitScheduler;
