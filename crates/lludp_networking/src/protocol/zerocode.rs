//! # Zero-Run Compression
//!
//! Every run of zero bytes becomes a `0x00, count` pair (count 1..=255).
//! Runs longer than 255 are split. Non-zero bytes pass through unchanged.

use crate::error::{NetError, NetResult};

/// Upper bound on decoded output, guarding against expansion bombs.
pub const MAX_DECODED_LEN: usize = 8192;

/// Appends the zero-coded form of `src` to `dst`.
pub fn encode(src: &[u8], dst: &mut Vec<u8>) {
    let mut run: u8 = 0;
    for &byte in src {
        if byte == 0 {
            if run == u8::MAX {
                dst.extend_from_slice(&[0, run]);
                run = 0;
            }
            run += 1;
        } else {
            if run > 0 {
                dst.extend_from_slice(&[0, run]);
                run = 0;
            }
            dst.push(byte);
        }
    }
    if run > 0 {
        dst.extend_from_slice(&[0, run]);
    }
}

/// Returns the zero-coded length of `src` without encoding it.
#[must_use]
pub fn encoded_len(src: &[u8]) -> usize {
    let mut len = 0;
    let mut run = 0usize;
    for &byte in src {
        if byte == 0 {
            if run == 0 {
                len += 2;
            }
            run += 1;
            if run == 255 {
                run = 0;
            }
        } else {
            run = 0;
            len += 1;
        }
    }
    len
}

/// Appends the expansion of `src` to `dst`.
///
/// # Errors
///
/// Returns `MalformedPacket` if a marker is missing its count byte, carries a
/// zero count, or expands `dst` past `limit` bytes.
pub fn decode(src: &[u8], dst: &mut Vec<u8>, limit: usize) -> NetResult<()> {
    let mut bytes = src.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte == 0 {
            let count = bytes
                .next()
                .ok_or(NetError::MalformedPacket("zero run marker truncated"))?;
            if count == 0 {
                return Err(NetError::MalformedPacket("zero run of length 0"));
            }
            if dst.len() + usize::from(count) > limit {
                return Err(NetError::MalformedPacket("zero run exceeds expansion limit"));
            }
            dst.resize(dst.len() + usize::from(count), 0);
        } else {
            if dst.len() >= limit {
                return Err(NetError::MalformedPacket("zero-coded body exceeds expansion limit"));
            }
            dst.push(byte);
        }
    }
    Ok(())
}
