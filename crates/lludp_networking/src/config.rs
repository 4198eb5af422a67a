//! # Server Configuration
//!
//! Loaded once at startup from TOML. Every field has a default, so an empty
//! file (or no file at all) yields a working loopback server.
//!
//! ```toml
//! bind_address = "0.0.0.0:9000"
//! packet_pool_size = 8192
//!
//! [region]
//! name = "Sandbox"
//! handle = 1099511628032000
//!
//! [circuit]
//! inactivity_timeout_ms = 60000
//! max_resends = 5
//! ```

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Per-circuit timing and throttle settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Silence after which a circuit is torn down.
    pub inactivity_timeout_ms: u64,
    /// How long a sent `LogoutReply` may stay unacknowledged.
    pub logout_ack_timeout_ms: u64,
    /// How long a pre-registered circuit waits for `UseCircuitCode`.
    pub handshake_timeout_ms: u64,
    /// Minimum age of an unacked packet before it is resent.
    pub resend_after_ms: u64,
    /// Retransmission cap per packet.
    pub max_resends: u32,
    /// Interval between outbound `StartPingCheck` pings.
    pub ping_interval_ms: u64,
    /// Interval between `SimStats` reports.
    pub stats_interval_ms: u64,
    /// Cadence of dedicated `PacketAck` flushes.
    pub ack_flush_interval_ms: u64,
    /// Initial throttle rate, bytes per second.
    pub default_throttle_bps: u64,
    /// Floor of the bucket's drain rate, bytes per second.
    pub min_throttle_bps: u64,
    /// Ceiling for client-requested throttle rates, bytes per second.
    pub max_throttle_bps: u64,
    /// Packets each queue class may send per scheduler pass.
    pub class_quantum: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: 60_000,
            logout_ack_timeout_ms: 10_000,
            handshake_timeout_ms: 60_000,
            resend_after_ms: 1_000,
            max_resends: 5,
            ping_interval_ms: 5_000,
            stats_interval_ms: 1_000,
            ack_flush_interval_ms: 1_000,
            default_throttle_bps: 187_500,
            min_throttle_bps: 4_000,
            max_throttle_bps: 1_250_000,
            class_quantum: 8,
        }
    }
}

/// Identity of the region this simulator hosts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Global region handle (x and y in meters, packed).
    pub handle: u64,
    /// Display name sent in `RegionHandshake`.
    pub name: String,
    /// Region UUID.
    pub region_id: Uuid,
    /// Region flags bitfield.
    pub flags: u32,
    /// Maturity rating.
    pub sim_access: u8,
    /// Maximum object count reported in `SimStats`.
    pub object_capacity: u32,
}

impl RegionConfig {
    /// Grid x coordinate in region units (256 m).
    #[must_use]
    pub const fn grid_x(&self) -> u32 {
        ((self.handle >> 32) / 256) as u32
    }

    /// Grid y coordinate in region units (256 m).
    #[must_use]
    pub const fn grid_y(&self) -> u32 {
        ((self.handle & 0xFFFF_FFFF) / 256) as u32
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            // 1000, 1000 in grid units.
            handle: (256_000u64 << 32) | 256_000,
            name: "Sandbox".to_string(),
            region_id: Uuid::nil(),
            flags: 0,
            sim_access: 13,
            object_capacity: 15_000,
        }
    }
}

/// How circuit workers are driven.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// One transmit thread and one object-update thread per circuit.
    #[default]
    Threaded,
    /// No threads; the owner calls [`crate::LludpServer::pump`].
    Manual,
}

/// Server configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the UDP socket to.
    pub bind_address: SocketAddr,
    /// Number of packet buffers shared by all circuits.
    pub packet_pool_size: usize,
    /// Socket read timeout; bounds how quickly `run` notices shutdown.
    pub recv_timeout_ms: u64,
    /// Worker threading.
    pub worker_mode: WorkerMode,
    /// Hosted region.
    pub region: RegionConfig,
    /// Circuit settings.
    pub circuit: CircuitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 9000)),
            packet_pool_size: 8192,
            recv_timeout_ms: 100,
            worker_mode: WorkerMode::Threaded,
            region: RegionConfig::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads and validates a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or fails validation.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.circuit;
        if self.packet_pool_size == 0 {
            return Err(ConfigError::Invalid("packet_pool_size must be > 0".into()));
        }
        if c.inactivity_timeout_ms == 0
            || c.logout_ack_timeout_ms == 0
            || c.handshake_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }
        if c.ping_interval_ms == 0 || c.stats_interval_ms == 0 || c.ack_flush_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be > 0".into()));
        }
        if c.class_quantum == 0 {
            return Err(ConfigError::Invalid("class_quantum must be > 0".into()));
        }
        if c.min_throttle_bps == 0
            || c.min_throttle_bps > c.default_throttle_bps
            || c.default_throttle_bps > c.max_throttle_bps
        {
            return Err(ConfigError::Invalid(
                "throttle rates must satisfy 0 < min <= default <= max".into(),
            ));
        }
        Ok(())
    }
}
