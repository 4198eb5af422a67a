//! # Transport Error Types
//!
//! All errors that can occur in the transport core.

use thiserror::Error;

/// Errors raised by the codec, circuits and the dispatcher.
#[derive(Error, Debug)]
pub enum NetError {
    /// The datagram could not be decoded. The packet is dropped; the circuit
    /// carries on.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// An encoded packet would exceed the hard frame ceiling.
    #[error("packet too large: {size} bytes exceeds limit of {limit}")]
    PacketTooLarge {
        /// Encoded size.
        size: usize,
        /// Applicable limit.
        limit: usize,
    },

    /// No packet buffer was free. Callers treat this as backpressure.
    #[error("packet buffer pool exhausted")]
    PoolExhausted,

    /// The circuit is closing or closed and accepts no more traffic.
    #[error("circuit {0} is closed")]
    CircuitClosed(u32),

    /// No circuit matches the given code or agent.
    #[error("unknown circuit")]
    UnknownCircuit,

    /// The circuit has no bound remote address yet.
    #[error("circuit has no remote endpoint")]
    NotConnected,

    /// Socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type NetResult<T> = Result<T, NetError>;

/// Errors raised while loading the server configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for this schema.
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
