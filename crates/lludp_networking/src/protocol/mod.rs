//! # Network Protocol
//!
//! Binary packet format of the legacy simulator protocol.
//!
//! ## Packet Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (6 bytes + extra)                                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Flags (1) │ Sequence (4, BE) │ Extra length (1)              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Message tag (1, 2 or 4) + body, optionally zero-coded        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Ack block (4 * N, BE) + N (1)        only with the ACK flag  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Philosophy
//!
//! - Format compatibility over compactness
//! - Decoding never panics; bad input is `MalformedPacket`
//! - Routing tables are `match` expressions, fixed at compile time

mod codec;
mod header;
mod message;
mod serialization;
pub mod zerocode;

pub use codec::{
    append_acks, decode, encode_to_vec, mark_resent, Packet, PacketEncoder, MAX_PIGGYBACK_ACKS,
};
pub use header::{PacketFlags, WireHeader};
pub use message::{Message, MessageId, THROTTLE_CATEGORIES};
pub use serialization::{PacketReader, PacketWriter};
