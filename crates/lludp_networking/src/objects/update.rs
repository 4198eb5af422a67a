//! Entity change records and per-viewer permission patching.

use std::sync::Arc;

use bitflags::bitflags;
use uuid::Uuid;

bitflags! {
    /// Object flag bits carried at offset 4..8 of a full update block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PrimFlags: u32 {
        /// Physical object.
        const PHYSICS = 0x0000_0001;
        /// Created selected.
        const CREATE_SELECTED = 0x0000_0002;
        /// Viewer may modify.
        const OBJECT_MODIFY = 0x0000_0004;
        /// Viewer may copy.
        const OBJECT_COPY = 0x0000_0008;
        /// Object has an owner.
        const OBJECT_ANY_OWNER = 0x0000_0010;
        /// Viewer owns the object.
        const OBJECT_YOU_OWNER = 0x0000_0020;
        /// Scripted.
        const SCRIPTED = 0x0000_0040;
        /// Handles touch.
        const TOUCH = 0x0000_0080;
        /// Viewer may move.
        const OBJECT_MOVE = 0x0000_0100;
        /// Accepts money.
        const MONEY = 0x0000_0200;
        /// Phantom.
        const PHANTOM = 0x0000_0400;
        /// Viewer may transfer.
        const OBJECT_TRANSFER = 0x0002_0000;
    }
}

impl PrimFlags {
    /// Bits recomputed for every viewer.
    pub const PERMISSION_BITS: Self = Self::OBJECT_MODIFY
        .union(Self::OBJECT_COPY)
        .union(Self::OBJECT_ANY_OWNER)
        .union(Self::OBJECT_YOU_OWNER)
        .union(Self::OBJECT_MOVE)
        .union(Self::OBJECT_TRANSFER);
}

bitflags! {
    /// Inventory-style permission mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PermissionMask: u32 {
        /// May transfer.
        const TRANSFER = 1 << 13;
        /// May modify.
        const MODIFY = 1 << 14;
        /// May copy.
        const COPY = 1 << 15;
        /// May move.
        const MOVE = 1 << 19;
    }
}

impl PermissionMask {
    /// The prim flags this mask grants.
    #[must_use]
    pub const fn grants(self) -> PrimFlags {
        let mut flags = PrimFlags::empty();
        if self.contains(Self::MODIFY) {
            flags = flags.union(PrimFlags::OBJECT_MODIFY);
        }
        if self.contains(Self::COPY) {
            flags = flags.union(PrimFlags::OBJECT_COPY);
        }
        if self.contains(Self::MOVE) {
            flags = flags.union(PrimFlags::OBJECT_MOVE);
        }
        if self.contains(Self::TRANSFER) {
            flags = flags.union(PrimFlags::OBJECT_TRANSFER);
        }
        flags
    }
}

/// Owner and everyone permission masks of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectPermissions {
    /// What the owner may do.
    pub owner_mask: PermissionMask,
    /// What everyone else may do.
    pub everyone_mask: PermissionMask,
}

/// Offset of the flags field in a full update block.
pub const FLAGS_OFFSET: usize = 4;

/// One entity's pending change.
///
/// If `killed` is set every other field except `local_id` is ignored.
#[derive(Debug, Clone)]
pub struct ObjectUpdateInfo {
    /// Region-local entity id.
    pub local_id: u32,
    /// Owning agent, nil for unowned entities.
    pub owner_id: Uuid,
    /// The entity was removed.
    pub killed: bool,
    /// The entity is physics-active (served in the priority lane).
    pub physical: bool,
    /// Bumped by the world model on every non-motion change.
    pub serial: u32,
    /// Full update block: local id, flags, owner, then the rest.
    pub full: Arc<[u8]>,
    /// Terse update block, at most 255 bytes.
    pub terse: Arc<[u8]>,
    /// Permission masks.
    pub permissions: ObjectPermissions,
}

impl ObjectUpdateInfo {
    /// A removal record.
    #[must_use]
    pub fn killed(local_id: u32) -> Self {
        Self {
            local_id,
            owner_id: Uuid::nil(),
            killed: true,
            physical: false,
            serial: 0,
            full: Arc::from(&[][..]),
            terse: Arc::from(&[][..]),
            permissions: ObjectPermissions::default(),
        }
    }
}

/// Lays out a full update block: `[local_id][flags][owner][body]`.
#[must_use]
pub fn encode_full_block(local_id: u32, flags: PrimFlags, owner_id: &Uuid, body: &[u8]) -> Arc<[u8]> {
    let mut block = Vec::with_capacity(24 + body.len());
    block.extend_from_slice(&local_id.to_le_bytes());
    block.extend_from_slice(&flags.bits().to_le_bytes());
    block.extend_from_slice(owner_id.as_bytes());
    block.extend_from_slice(body);
    Arc::from(block)
}

/// Reads the flags field of a full update block.
#[must_use]
pub fn block_flags(block: &[u8]) -> Option<PrimFlags> {
    let bytes = block.get(FLAGS_OFFSET..FLAGS_OFFSET + 4)?;
    Some(PrimFlags::from_bits_retain(u32::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3],
    ])))
}

/// Rewrites the permission bits of a full update block for `viewer`.
///
/// The owner sees the owner mask grants plus `OBJECT_YOU_OWNER`; anyone else
/// sees the everyone mask grants. `OBJECT_ANY_OWNER` is set only for owned
/// entities. Other flag bits are left alone. Blocks too short to carry flags
/// are not touched.
pub fn patch_permissions(block: &mut [u8], info: &ObjectUpdateInfo, viewer: &Uuid) {
    let Some(current) = block_flags(block) else {
        return;
    };
    let mut flags = current.difference(PrimFlags::PERMISSION_BITS);

    if !info.owner_id.is_nil() {
        flags |= PrimFlags::OBJECT_ANY_OWNER;
    }
    if !info.owner_id.is_nil() && info.owner_id == *viewer {
        flags |= info.permissions.owner_mask.grants() | PrimFlags::OBJECT_YOU_OWNER;
    } else {
        flags |= info.permissions.everyone_mask.grants();
    }

    block[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&flags.bits().to_le_bytes());
}
