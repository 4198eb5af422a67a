//! # Packet Codec
//!
//! Frames messages into datagrams and parses datagrams back.
//!
//! ## Layout
//!
//! ```text
//! ┌───────┬──────────────┬───────────┬───────────┬──────────────┬────────────┬─────┐
//! │ flags │ sequence (BE)│ extra_len │ extra ... │ tag + body   │ acks (BE)  │  N  │
//! │  1    │      4       │     1     │ extra_len │ maybe zc'd   │   4 * N    │  1  │
//! └───────┴──────────────┴───────────┴───────────┴──────────────┴────────────┴─────┘
//! ```
//!
//! The ack block is never zero-coded and is read backwards from the end.

use std::collections::VecDeque;

use lludp_core::PacketBuffer;

use super::header::{PacketFlags, WireHeader};
use super::message::Message;
use super::serialization::{PacketReader, PacketWriter};
use super::zerocode;
use crate::error::{NetError, NetResult};
use crate::MAX_PACKET_SIZE;

/// Most acks one datagram can carry (the count is a single byte).
pub const MAX_PIGGYBACK_ACKS: usize = 255;

/// A decoded datagram.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    /// Header flags.
    pub flags: PacketFlags,
    /// Sender's sequence number.
    pub sequence: u32,
    /// Decoded message.
    pub message: Message,
    /// Acks appended by the sender.
    pub acks: Vec<u32>,
}

impl Packet {
    /// Whether the sender expects an ack.
    #[inline]
    #[must_use]
    pub const fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    /// Whether this is a retransmission.
    #[inline]
    #[must_use]
    pub const fn is_resent(&self) -> bool {
        self.flags.contains(PacketFlags::RESENT)
    }
}

/// Reusable message framer.
///
/// Holds scratch buffers so steady-state encoding does not allocate.
#[derive(Debug, Default)]
pub struct PacketEncoder {
    body: PacketWriter,
    frame: Vec<u8>,
}

impl PacketEncoder {
    /// Creates an encoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            body: PacketWriter::new(),
            frame: Vec::with_capacity(MAX_PACKET_SIZE),
        }
    }

    /// Frames `message` and returns the datagram bytes (no ack block).
    ///
    /// Zero-run compression is applied only to message types that allow it,
    /// and only when it makes the packet smaller.
    ///
    /// # Errors
    ///
    /// Returns `PacketTooLarge` if the frame exceeds the hard ceiling.
    pub fn frame(&mut self, message: &Message, sequence: u32, reliable: bool) -> NetResult<&[u8]> {
        self.body.reset();
        message.encode(&mut self.body);

        let body = self.body.as_slice();
        let mut flags = PacketFlags::empty();
        if reliable {
            flags |= PacketFlags::RELIABLE;
        }
        let zero_coded = message.is_zero_coded() && zerocode::encoded_len(body) < body.len();
        if zero_coded {
            flags |= PacketFlags::ZERO_CODED;
        }

        self.frame.clear();
        self.frame
            .extend_from_slice(bytemuck::bytes_of(&WireHeader::new(flags, sequence)));
        if zero_coded {
            zerocode::encode(body, &mut self.frame);
        } else {
            self.frame.extend_from_slice(body);
        }

        if self.frame.len() > MAX_PACKET_SIZE {
            return Err(NetError::PacketTooLarge {
                size: self.frame.len(),
                limit: MAX_PACKET_SIZE,
            });
        }
        Ok(&self.frame)
    }

    /// Frames `message` into a pooled buffer, replacing its contents.
    ///
    /// # Errors
    ///
    /// Returns `PacketTooLarge` if the frame exceeds the hard ceiling.
    pub fn encode(
        &mut self,
        message: &Message,
        sequence: u32,
        reliable: bool,
        out: &mut PacketBuffer,
    ) -> NetResult<()> {
        let frame = self.frame(message, sequence, reliable)?;
        out.clear();
        if !out.extend_from_slice(frame) {
            return Err(NetError::PacketTooLarge {
                size: frame.len(),
                limit: MAX_PACKET_SIZE,
            });
        }
        Ok(())
    }
}

/// Moves as many pending acks as fit onto the end of a framed packet.
///
/// Returns the number appended. Packets that already carry acks are left
/// alone.
pub fn append_acks(out: &mut PacketBuffer, pending: &mut VecDeque<u32>) -> usize {
    if pending.is_empty() || out.len() < WireHeader::SIZE {
        return 0;
    }
    if out.as_slice()[0] & PacketFlags::ACK.bits() != 0 {
        return 0;
    }
    let room = out.remaining().saturating_sub(1) / 4;
    let count = pending.len().min(room).min(MAX_PIGGYBACK_ACKS);
    if count == 0 {
        return 0;
    }
    for seq in pending.drain(..count) {
        out.extend_from_slice(&seq.to_be_bytes());
    }
    out.push(count as u8);
    out.as_mut_slice()[0] |= PacketFlags::ACK.bits();
    count
}

/// Sets the resent flag on an already framed packet.
#[inline]
pub fn mark_resent(packet: &mut PacketBuffer) {
    if let Some(flags) = packet.as_mut_slice().first_mut() {
        *flags |= PacketFlags::RESENT.bits();
    }
}

/// Parses a datagram.
///
/// # Errors
///
/// Returns `MalformedPacket` if the header, extra header, ack block or body
/// overruns the datagram, or the body fails to decode.
pub fn decode(data: &[u8]) -> NetResult<Packet> {
    if data.len() < WireHeader::SIZE + 1 {
        return Err(NetError::MalformedPacket("datagram shorter than header"));
    }
    let header: WireHeader = bytemuck::pod_read_unaligned(&data[..WireHeader::SIZE]);
    let flags = header.flags();
    let body_start = WireHeader::SIZE + usize::from(header.extra_len);

    let mut body_end = data.len();
    let mut acks = Vec::new();
    if flags.contains(PacketFlags::ACK) {
        let count = usize::from(data[body_end - 1]);
        let block = count * 4 + 1;
        if body_start + block > body_end {
            return Err(NetError::MalformedPacket("ack block overruns datagram"));
        }
        body_end -= block;
        acks.extend(
            data[body_end..body_end + count * 4]
                .chunks_exact(4)
                .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
        );
    }
    if body_start >= body_end {
        return Err(NetError::MalformedPacket("extra header overruns datagram"));
    }

    let body = &data[body_start..body_end];
    let message = if flags.contains(PacketFlags::ZERO_CODED) {
        let mut expanded = Vec::with_capacity(body.len() * 2);
        zerocode::decode(body, &mut expanded, zerocode::MAX_DECODED_LEN)?;
        Message::decode(&mut PacketReader::new(&expanded))?
    } else {
        Message::decode(&mut PacketReader::new(body))?
    };

    Ok(Packet {
        flags,
        sequence: header.sequence(),
        message,
        acks,
    })
}

/// Frames a message into a fresh `Vec` with the given acks appended.
///
/// Convenience for tools and tests; the send path uses [`PacketEncoder`].
///
/// # Errors
///
/// Returns `PacketTooLarge` if the frame plus acks exceeds the hard ceiling.
pub fn encode_to_vec(
    message: &Message,
    sequence: u32,
    reliable: bool,
    acks: &[u32],
) -> NetResult<Vec<u8>> {
    let mut encoder = PacketEncoder::new();
    let mut out = encoder.frame(message, sequence, reliable)?.to_vec();
    let acks = &acks[..acks.len().min(MAX_PIGGYBACK_ACKS)];
    if !acks.is_empty() {
        for seq in acks {
            out.extend_from_slice(&seq.to_be_bytes());
        }
        out.push(acks.len() as u8);
        out[0] |= PacketFlags::ACK.bits();
    }
    if out.len() > MAX_PACKET_SIZE {
        return Err(NetError::PacketTooLarge {
            size: out.len(),
            limit: MAX_PACKET_SIZE,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageId;
    use lludp_core::BufferPool;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn logout_reply() -> Message {
        Message::LogoutReply {
            agent_id: Uuid::nil(),
            session_id: Uuid::from_u128(7),
        }
    }

    #[test]
    fn test_header_fields() {
        let bytes = encode_to_vec(&Message::CompletePingCheck { ping_id: 4 }, 0x0A0B_0C0D, true, &[])
            .unwrap();
        assert_eq!(bytes, vec![0x40, 0x0A, 0x0B, 0x0C, 0x0D, 0, 2, 4]);
    }

    #[test]
    fn test_zero_coding_only_when_smaller() {
        // Mostly zero UUIDs: compresses.
        let bytes = encode_to_vec(&logout_reply(), 1, true, &[]).unwrap();
        assert!(bytes[0] & PacketFlags::ZERO_CODED.bits() != 0);
        assert!(bytes.len() < WireHeader::SIZE + 4 + 32);
        assert_eq!(decode(&bytes).unwrap().message, logout_reply());

        // Not a zero-coded type: stays plain even though it has zeros.
        let kill = Message::KillObject {
            local_ids: vec![0, 0, 0],
        };
        let bytes = encode_to_vec(&kill, 1, true, &[]).unwrap();
        assert_eq!(bytes[0] & PacketFlags::ZERO_CODED.bits(), 0);
    }

    #[test]
    fn test_incompressible_body_not_zero_coded() {
        let reply = Message::LogoutReply {
            agent_id: Uuid::from_bytes([0x11; 16]),
            session_id: Uuid::from_bytes([0x22; 16]),
        };
        let bytes = encode_to_vec(&reply, 1, true, &[]).unwrap();
        assert_eq!(bytes[0] & PacketFlags::ZERO_CODED.bits(), 0);
    }

    #[test]
    fn test_piggybacked_acks() {
        let pool = BufferPool::new(1);
        let mut buffer = pool.try_acquire().unwrap();
        let mut encoder = PacketEncoder::new();
        encoder
            .encode(&Message::CompletePingCheck { ping_id: 1 }, 9, false, &mut buffer)
            .unwrap();

        let mut pending: VecDeque<u32> = [100, 101, 102].into_iter().collect();
        assert_eq!(append_acks(&mut buffer, &mut pending), 3);
        assert!(pending.is_empty());

        let packet = decode(buffer.as_slice()).unwrap();
        assert_eq!(packet.acks, vec![100, 101, 102]);
        assert_eq!(packet.message, Message::CompletePingCheck { ping_id: 1 });
        assert_eq!(packet.sequence, 9);
    }

    #[test]
    fn test_ack_append_respects_frame_ceiling() {
        let pool = BufferPool::new(1);
        let mut buffer = pool.try_acquire().unwrap();
        let mut encoder = PacketEncoder::new();
        let layer = Message::LayerData {
            layer_type: b'L',
            data: vec![1; 1470],
        };
        encoder.encode(&layer, 1, true, &mut buffer).unwrap();

        let mut pending: VecDeque<u32> = (0..50).collect();
        let appended = append_acks(&mut buffer, &mut pending);
        assert!(appended < 50);
        assert!(buffer.len() <= MAX_PACKET_SIZE);
        assert_eq!(pending.len(), 50 - appended);
    }

    #[test]
    fn test_ack_count_overrun_rejected() {
        let mut bytes = encode_to_vec(&Message::CloseCircuit, 1, false, &[5]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = 200;
        assert!(matches!(decode(&bytes), Err(NetError::MalformedPacket(_))));
    }

    #[test]
    fn test_extra_header_skipped() {
        let mut bytes = encode_to_vec(&Message::CompletePingCheck { ping_id: 3 }, 1, false, &[])
            .unwrap();
        bytes[5] = 2;
        bytes.splice(6..6, [0xEE, 0xEE]);
        assert_eq!(
            decode(&bytes).unwrap().message,
            Message::CompletePingCheck { ping_id: 3 }
        );

        bytes[5] = 40;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_zero_coded_overrun_rejected() {
        // Zero-coded flag, tag 0x00 with the count byte missing.
        let bytes = [0x80, 0, 0, 0, 1, 0, 0];
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_resent_flag() {
        let pool = BufferPool::new(1);
        let mut buffer = pool.try_acquire().unwrap();
        PacketEncoder::new()
            .encode(&Message::CloseCircuit, 5, false, &mut buffer)
            .unwrap();
        mark_resent(&mut buffer);
        let packet = decode(buffer.as_slice()).unwrap();
        assert!(packet.is_resent());
        assert_eq!(packet.message.id(), MessageId::CLOSE_CIRCUIT);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..1600)) {
            let _ = decode(&data);
        }

        #[test]
        fn prop_acks_survive(acks in proptest::collection::vec(any::<u32>(), 0..255), seq in any::<u32>()) {
            let bytes = encode_to_vec(&Message::CloseCircuit, seq, false, &acks).unwrap();
            let packet = decode(&bytes).unwrap();
            prop_assert_eq!(packet.sequence, seq);
            prop_assert_eq!(packet.acks, acks);
        }
    }
}
