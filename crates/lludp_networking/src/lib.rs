//! # LLUDP Networking - Simulator Session Transport
//!
//! Reliable, throttled circuits over a legacy UDP wire format, carrying avatar
//! and world-state traffic between viewers and a simulator.
//!
//! ## Architecture
//!
//! This crate implements the complete transport core:
//!
//! - **Protocol**: Packet framing, message catalogue, zero-run compression
//! - **Circuit**: Sequence numbers, unacked table, resends, pings, liveness
//! - **Scheduler**: Per-circuit prioritized, token-bucket throttled sender
//! - **Objects**: Full/terse/kill update batching under the MTU budget
//! - **Server**: Socket ownership, handshake admission, datagram routing
//!
//! ## Threading Model
//!
//! ```text
//!   socket thread ──> Circuit::receive ──┬──> acks / pings / logout (in place)
//!                                        └──> application messages ──> services
//!
//!   world model ──> ObjectUpdateQueue ──> [object thread] ──┐
//!   collaborators ──> Circuit::send ────────────────────────┴──> [transmit thread] ──> socket
//! ```
//!
//! Each circuit's transmit thread is the only writer of its throttle bucket and
//! priority queues. State shared with the receive path (unacked table, ping
//! tracker, pending acks) sits behind `parking_lot` locks or crossbeam channels.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lludp_networking::{LludpServer, ServerConfig, Services};
//!
//! let server = LludpServer::bind(ServerConfig::default(), Services::default())?;
//! server.register_pending(circuit_code, session_id, agent_id);
//! server.run(); // Blocks until shutdown()
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod circuit;
pub mod config;
pub mod error;
pub mod objects;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod throttle;
pub mod transport;

// Re-exports for convenience
pub use circuit::{
    Circuit, CircuitCode, CircuitIdentity, CircuitObserver, CircuitState, CloseReason,
    OutboundMessage,
};
pub use config::{CircuitConfig, RegionConfig, ServerConfig, WorkerMode};
pub use error::{ConfigError, NetError, NetResult};
pub use objects::{
    ObjectPermissions, ObjectUpdateInfo, ObjectUpdateQueue, ObjectUpdateScheduler, PrimFlags,
};
pub use protocol::{Message, MessageId, Packet, PacketEncoder, PacketFlags};
pub use scheduler::{QueueClass, TransmitScheduler};
pub use server::{LludpServer, Services};
pub use throttle::{ThrottleBucket, ThrottleRates};
pub use transport::{DatagramSink, UdpTransport};

/// Soft payload budget for every batched message (tag + body), in bytes.
pub const MTU_BUDGET: usize = 1400;

/// Hard UDP frame ceiling, in bytes.
pub const MAX_PACKET_SIZE: usize = lludp_core::BUFFER_SIZE;

/// Maximum entity ids carried by one `KillObject` message.
pub const MAX_KILLS_PER_PACKET: usize = 250;

/// Maximum sequence numbers carried by one dedicated `PacketAck` message.
pub const MAX_ACKS_PER_PACKET: usize = 100;
