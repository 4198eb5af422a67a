//! # Field Serialization
//!
//! Little-endian field writers and bounds-checked readers for message bodies.
//!
//! ## Design
//!
//! - The writer owns a reusable `Vec`; [`PacketWriter::reset`] keeps capacity
//! - The reader never panics: every short read is `MalformedPacket`
//! - Strings are `u8` length prefixed, blobs `u16` length prefixed

use uuid::Uuid;

use crate::error::{NetError, NetResult};

/// Growable body writer, reused across encodes to avoid reallocation.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    /// Creates a writer with room for one full frame.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(crate::MAX_PACKET_SIZE),
        }
    }

    /// Clears the written bytes, keeping the allocation.
    #[inline]
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Returns the number of bytes written.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if no bytes have been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns the written bytes.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Writes a single byte.
    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Writes a u16 in little-endian format.
    #[inline]
    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a u16 in big-endian format (message tags).
    #[inline]
    pub fn write_u16_be(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a u32 in little-endian format.
    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a u64 in little-endian format.
    #[inline]
    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes an i32 in little-endian format.
    #[inline]
    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a f32 in little-endian format.
    #[inline]
    pub fn write_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a UUID as its 16 raw bytes.
    #[inline]
    pub fn write_uuid(&mut self, value: &Uuid) {
        self.buffer.extend_from_slice(value.as_bytes());
    }

    /// Writes raw bytes with no prefix.
    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Writes a `u8`-length-prefixed string, truncated to 255 bytes on a
    /// character boundary.
    pub fn write_string(&mut self, value: &str) {
        let mut end = value.len().min(usize::from(u8::MAX));
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.write_u8(end as u8);
        self.write_bytes(&value.as_bytes()[..end]);
    }

    /// Writes a `u16`-length-prefixed blob, truncated to 65 535 bytes.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(usize::from(u16::MAX));
        self.write_u16(len as u16);
        self.write_bytes(&bytes[..len]);
    }
}

/// Bounds-checked body reader.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> PacketReader<'a> {
    /// Creates a reader over `buffer`.
    #[must_use]
    pub const fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Returns the number of bytes remaining.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Reads exactly `n` bytes.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if fewer than `n` bytes remain.
    #[inline]
    pub fn read_bytes(&mut self, n: usize) -> NetResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(NetError::MalformedPacket("field overruns buffer"));
        }
        let slice = &self.buffer[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> NetResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Reads a single byte.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` on a short buffer.
    #[inline]
    pub fn read_u8(&mut self) -> NetResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a u16 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` on a short buffer.
    #[inline]
    pub fn read_u16(&mut self) -> NetResult<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Reads a u16 in big-endian format.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` on a short buffer.
    #[inline]
    pub fn read_u16_be(&mut self) -> NetResult<u16> {
        self.read_array().map(u16::from_be_bytes)
    }

    /// Reads a u32 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` on a short buffer.
    #[inline]
    pub fn read_u32(&mut self) -> NetResult<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Reads a u64 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` on a short buffer.
    #[inline]
    pub fn read_u64(&mut self) -> NetResult<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Reads an i32 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` on a short buffer.
    #[inline]
    pub fn read_i32(&mut self) -> NetResult<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    /// Reads a f32 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` on a short buffer.
    #[inline]
    pub fn read_f32(&mut self) -> NetResult<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    /// Reads a UUID.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` on a short buffer.
    #[inline]
    pub fn read_uuid(&mut self) -> NetResult<Uuid> {
        self.read_array().map(Uuid::from_bytes)
    }

    /// Reads a `u8`-length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the length overruns the buffer or the
    /// bytes are not UTF-8.
    pub fn read_string(&mut self) -> NetResult<String> {
        let len = usize::from(self.read_u8()?);
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| NetError::MalformedPacket("string is not utf-8"))
    }

    /// Reads a `u16`-length-prefixed blob.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the length overruns the buffer.
    pub fn read_blob(&mut self) -> NetResult<&'a [u8]> {
        let len = usize::from(self.read_u16()?);
        self.read_bytes(len)
    }

    /// Consumes and returns everything left.
    #[must_use]
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buffer[self.position.min(self.buffer.len())..];
        self.position = self.buffer.len();
        rest
    }
}
