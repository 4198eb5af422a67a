//! # LLUDP Core
//!
//! Building blocks shared by the transport crates:
//! - A bounded, pre-allocated pool of MTU-sized packet buffers
//! - A millisecond clock that can be driven manually in tests
//!
//! ## Architecture Rules
//!
//! 1. **No allocation churn in hot path** - Packet buffers are allocated once
//! 2. **Exhaustion is backpressure** - An empty pool never blocks the caller
//! 3. **Time is injected** - Every timeout is evaluated against a [`Clock`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use lludp_core::{BufferPool, ManualClock, Clock};
//!
//! let pool = BufferPool::new(1024);
//! let buffer = pool.try_acquire().expect("pool has free buffers");
//! pool.release(buffer);
//!
//! let clock = ManualClock::new(0);
//! clock.advance(60_001);
//! assert_eq!(clock.now_ms(), 60_001);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod memory;
pub mod time;

pub use memory::{BufferPool, PacketBuffer, BUFFER_SIZE};
pub use time::{Clock, ManualClock, SystemClock};
