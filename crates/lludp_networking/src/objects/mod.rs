//! # Object Updates
//!
//! Per-viewer scheduling of entity changes.
//!
//! ## Design
//!
//! - [`ObjectUpdateInfo`] is what the world model produces; it never sees
//!   wire messages
//! - Full blocks are patched per viewer so owners see their own permissions
//! - [`ObjectUpdateScheduler`] runs on its own thread beside the transmit
//!   scheduler and feeds the circuit like any other producer

mod scheduler;
mod update;

pub use scheduler::{ObjectUpdateQueue, ObjectUpdateScheduler};
pub use update::{
    block_flags, encode_full_block, patch_permissions, ObjectPermissions, ObjectUpdateInfo,
    PermissionMask, PrimFlags, FLAGS_OFFSET,
};
