//! # Memory Management
//!
//! Pre-allocated packet buffers for the transport hot path.
//!
//! ## Design Philosophy
//!
//! All buffers are allocated once when the pool is created. While circuits run:
//! - No per-packet heap allocation for buffers
//! - Buffers go back to the free list on ack, on unreliable send, or on teardown
//! - An empty pool is reported to the caller, never waited on

mod pool;

pub use pool::{BufferPool, PacketBuffer, BUFFER_SIZE};
