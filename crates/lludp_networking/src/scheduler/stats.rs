//! Telemetry reported in `SimStats`.

/// Region-wide values sampled once per stats interval.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionStats {
    /// Simulation speed relative to real time, 0.0..=1.0.
    pub time_dilation: f32,
    /// Simulator frames per second.
    pub sim_fps: f32,
    /// Physics frames per second.
    pub physics_fps: f32,
    /// Agent updates per second.
    pub agent_updates_per_sec: f32,
    /// Objects in the region.
    pub object_count: u32,
    /// Downloads in flight.
    pub pending_downloads: u32,
    /// Uploads in flight.
    pub pending_uploads: u32,
}

impl Default for RegionStats {
    fn default() -> Self {
        Self {
            time_dilation: 1.0,
            sim_fps: 45.0,
            physics_fps: 45.0,
            agent_updates_per_sec: 0.0,
            object_count: 0,
            pending_downloads: 0,
            pending_uploads: 0,
        }
    }
}

/// Supplies region telemetry to every circuit's scheduler.
pub trait StatsSource: Send + Sync {
    /// Samples current values.
    fn region_stats(&self) -> RegionStats;
}

/// Reports [`RegionStats::default`].
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleStats;

impl StatsSource for IdleStats {
    fn region_stats(&self) -> RegionStats {
        RegionStats::default()
    }
}

/// Stat ids understood by viewers.
pub mod stat_id {
    /// Time dilation.
    pub const TIME_DILATION: u32 = 0;
    /// Simulator fps.
    pub const SIM_FPS: u32 = 1;
    /// Physics fps.
    pub const PHYSICS_FPS: u32 = 2;
    /// Agent updates per second.
    pub const AGENT_UPDATES: u32 = 3;
    /// Total objects.
    pub const TOTAL_OBJECTS: u32 = 11;
    /// Inbound packets per second.
    pub const IN_PACKETS_PER_SEC: u32 = 17;
    /// Outbound packets per second.
    pub const OUT_PACKETS_PER_SEC: u32 = 18;
    /// Pending downloads.
    pub const PENDING_DOWNLOADS: u32 = 19;
    /// Pending uploads.
    pub const PENDING_UPLOADS: u32 = 20;
    /// Unacked bytes.
    pub const UNACKED_BYTES: u32 = 24;
}
