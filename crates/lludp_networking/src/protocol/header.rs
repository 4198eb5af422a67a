//! Fixed packet header and its flag byte.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        /// Tag and body are zero-run compressed.
        const ZERO_CODED = 0x80;
        /// The receiver must acknowledge this sequence number.
        const RELIABLE = 0x40;
        /// This is a retransmission.
        const RESENT = 0x20;
        /// An ack block is appended at the end of the datagram.
        const ACK = 0x10;
    }
}

/// The 6-byte header at the start of every datagram.
///
/// Layout:
/// - flags (1 byte)
/// - sequence (4 bytes, big-endian)
/// - extra header length (1 byte)
///
/// Total size: 6 bytes
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct WireHeader {
    /// Raw [`PacketFlags`] bits.
    pub flags: u8,
    /// Sequence number, big-endian.
    pub sequence: [u8; 4],
    /// Length of the opaque extra header that follows.
    pub extra_len: u8,
}

impl WireHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 6;

    /// Creates a header with no extra bytes.
    #[inline]
    #[must_use]
    pub const fn new(flags: PacketFlags, sequence: u32) -> Self {
        Self {
            flags: flags.bits(),
            sequence: sequence.to_be_bytes(),
            extra_len: 0,
        }
    }

    /// Returns the flags, dropping unknown bits.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits_truncate(self.flags)
    }

    /// Returns the sequence number.
    #[inline]
    #[must_use]
    pub const fn sequence(&self) -> u32 {
        u32::from_be_bytes(self.sequence)
    }
}
