//! # Message Catalogue
//!
//! Typed messages and their wire tags. Each message is identified by a
//! frequency class plus a number; the frequency decides the tag width.
//!
//! ## Tags
//!
//! ```text
//! High     id                  1 byte
//! Medium   FF id               2 bytes
//! Low      FF FF hi lo         4 bytes
//! Fixed    FF FF FF id         4 bytes
//! ```
//!
//! Bodies are little-endian. Any type without a typed variant decodes to
//! [`Message::Generic`] so collaborators can still send and receive it.

use std::sync::Arc;

use uuid::Uuid;

use super::serialization::{PacketReader, PacketWriter};
use crate::error::{NetError, NetResult};

/// Wire identity of a message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// One-byte tag, 1..=254.
    High(u8),
    /// Two-byte tag, 1..=254.
    Medium(u8),
    /// Four-byte tag, 1..=65 000.
    Low(u16),
    /// Four-byte tag, 0xFFFF_FFFA..=0xFFFF_FFFF.
    Fixed(u8),
}

impl MessageId {
    /// `StartPingCheck`
    pub const START_PING_CHECK: Self = Self::High(1);
    /// `CompletePingCheck`
    pub const COMPLETE_PING_CHECK: Self = Self::High(2);
    /// `ImagePacket`
    pub const IMAGE_PACKET: Self = Self::High(10);
    /// `LayerData`
    pub const LAYER_DATA: Self = Self::High(11);
    /// `ObjectUpdate`
    pub const OBJECT_UPDATE: Self = Self::High(12);
    /// `ImprovedTerseObjectUpdate`
    pub const IMPROVED_TERSE_OBJECT_UPDATE: Self = Self::High(15);
    /// `KillObject`
    pub const KILL_OBJECT: Self = Self::High(16);
    /// `TransferPacket`
    pub const TRANSFER_PACKET: Self = Self::High(17);
    /// `ImageData`
    pub const IMAGE_DATA: Self = Self::Medium(9);
    /// `UseCircuitCode`
    pub const USE_CIRCUIT_CODE: Self = Self::Low(3);
    /// `ChatFromViewer`
    pub const CHAT_FROM_VIEWER: Self = Self::Low(80);
    /// `AgentThrottle`
    pub const AGENT_THROTTLE: Self = Self::Low(81);
    /// `ChatFromSimulator`
    pub const CHAT_FROM_SIMULATOR: Self = Self::Low(139);
    /// `SimStats`
    pub const SIM_STATS: Self = Self::Low(140);
    /// `RegionHandshake`
    pub const REGION_HANDSHAKE: Self = Self::Low(148);
    /// `RegionHandshakeReply`
    pub const REGION_HANDSHAKE_REPLY: Self = Self::Low(149);
    /// `CompleteAgentMovement`
    pub const COMPLETE_AGENT_MOVEMENT: Self = Self::Low(249);
    /// `AgentMovementComplete`
    pub const AGENT_MOVEMENT_COMPLETE: Self = Self::Low(250);
    /// `LogoutRequest`
    pub const LOGOUT_REQUEST: Self = Self::Low(252);
    /// `LogoutReply`
    pub const LOGOUT_REPLY: Self = Self::Low(253);
    /// `ImprovedInstantMessage`
    pub const IMPROVED_INSTANT_MESSAGE: Self = Self::Low(254);
    /// `PacketAck`
    pub const PACKET_ACK: Self = Self::Fixed(0xFB);
    /// `CloseCircuit`
    pub const CLOSE_CIRCUIT: Self = Self::Fixed(0xFD);

    /// Returns the tag width in bytes.
    #[inline]
    #[must_use]
    pub const fn tag_len(self) -> usize {
        match self {
            Self::High(_) => 1,
            Self::Medium(_) => 2,
            Self::Low(_) | Self::Fixed(_) => 4,
        }
    }

    /// Writes the tag.
    pub fn write_tag(self, w: &mut PacketWriter) {
        match self {
            Self::High(id) => w.write_u8(id),
            Self::Medium(id) => w.write_bytes(&[0xFF, id]),
            Self::Low(id) => {
                w.write_bytes(&[0xFF, 0xFF]);
                w.write_u16_be(id);
            }
            Self::Fixed(id) => w.write_bytes(&[0xFF, 0xFF, 0xFF, id]),
        }
    }

    /// Reads a tag.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the buffer ends inside the tag.
    pub fn read_tag(r: &mut PacketReader<'_>) -> NetResult<Self> {
        let b0 = r.read_u8()?;
        if b0 != 0xFF {
            return Ok(Self::High(b0));
        }
        let b1 = r.read_u8()?;
        if b1 != 0xFF {
            return Ok(Self::Medium(b1));
        }
        let tail = r.read_u16_be()?;
        if tail >> 8 == 0xFF {
            Ok(Self::Fixed(tail as u8))
        } else {
            Ok(Self::Low(tail))
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High(id) => write!(f, "High {id}"),
            Self::Medium(id) => write!(f, "Medium {id}"),
            Self::Low(id) => write!(f, "Low {id}"),
            Self::Fixed(id) => write!(f, "Fixed 0xFFFFFF{id:02X}"),
        }
    }
}

/// Number of per-category throttle values in `AgentThrottle`.
pub const THROTTLE_CATEGORIES: usize = 7;

/// A protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Latency check.
    StartPingCheck {
        /// Id echoed by the peer.
        ping_id: u8,
        /// Oldest sequence the sender still waits on.
        oldest_unacked: u32,
    },
    /// Echo of a `StartPingCheck`.
    CompletePingCheck {
        /// Echoed ping id.
        ping_id: u8,
    },
    /// Terrain, wind or cloud patch data.
    LayerData {
        /// Layer type byte.
        layer_type: u8,
        /// Opaque compressed patch data.
        data: Vec<u8>,
    },
    /// Full object updates.
    ObjectUpdate {
        /// Region the objects live in.
        region_handle: u64,
        /// Time dilation, scaled to u16.
        time_dilation: u16,
        /// Pre-encoded object blocks.
        blocks: Vec<Vec<u8>>,
    },
    /// Compact position/motion updates.
    ImprovedTerseObjectUpdate {
        /// Region the objects live in.
        region_handle: u64,
        /// Time dilation, scaled to u16.
        time_dilation: u16,
        /// Pre-encoded terse blocks (at most 255 bytes each).
        blocks: Vec<Arc<[u8]>>,
    },
    /// Object removal.
    KillObject {
        /// Local ids of removed objects.
        local_ids: Vec<u32>,
    },
    /// Circuit handshake from the viewer.
    UseCircuitCode {
        /// Pre-registered circuit code.
        code: u32,
        /// Session id.
        session_id: Uuid,
        /// Agent id.
        agent_id: Uuid,
    },
    /// Local chat from the viewer.
    ChatFromViewer {
        /// Speaking agent.
        agent_id: Uuid,
        /// Session id.
        session_id: Uuid,
        /// Chat text.
        message: String,
        /// Whisper/say/shout.
        chat_type: u8,
        /// Chat channel.
        channel: i32,
    },
    /// Viewer bandwidth preferences.
    AgentThrottle {
        /// Agent id.
        agent_id: Uuid,
        /// Session id.
        session_id: Uuid,
        /// Circuit code.
        circuit_code: u32,
        /// Generation counter; stale values are ignored.
        gen_counter: u32,
        /// Bits per second for resend, land, wind, cloud, task, texture, asset.
        throttles: [f32; THROTTLE_CATEGORIES],
    },
    /// Local chat to the viewer.
    ChatFromSimulator {
        /// Display name of the speaker.
        from_name: String,
        /// Speaking entity.
        source_id: Uuid,
        /// Owner of the speaking entity.
        owner_id: Uuid,
        /// Agent/object/system.
        source_type: u8,
        /// Whisper/say/shout.
        chat_type: u8,
        /// Audibility level.
        audible: u8,
        /// Speaker position.
        position: [f32; 3],
        /// Chat text.
        message: String,
    },
    /// Simulator telemetry.
    SimStats {
        /// Region grid x.
        region_x: u32,
        /// Region grid y.
        region_y: u32,
        /// Region flags.
        region_flags: u32,
        /// Object capacity.
        object_capacity: u32,
        /// `(stat id, value)` pairs.
        stats: Vec<(u32, f32)>,
    },
    /// Region description sent after the handshake.
    RegionHandshake {
        /// Region flags.
        region_flags: u32,
        /// Maturity rating.
        sim_access: u8,
        /// Region name.
        region_name: String,
        /// Region id.
        region_id: Uuid,
    },
    /// Viewer reply to `RegionHandshake`.
    RegionHandshakeReply {
        /// Agent id.
        agent_id: Uuid,
        /// Session id.
        session_id: Uuid,
        /// Viewer flags.
        flags: u32,
    },
    /// Viewer announces it entered the region.
    CompleteAgentMovement {
        /// Agent id.
        agent_id: Uuid,
        /// Session id.
        session_id: Uuid,
        /// Circuit code.
        circuit_code: u32,
    },
    /// Simulator confirms region entry.
    AgentMovementComplete {
        /// Agent id.
        agent_id: Uuid,
        /// Session id.
        session_id: Uuid,
        /// Region handle.
        region_handle: u64,
        /// Seconds since the epoch.
        timestamp: u32,
    },
    /// Viewer asks to log out.
    LogoutRequest {
        /// Agent id.
        agent_id: Uuid,
        /// Session id.
        session_id: Uuid,
    },
    /// Simulator confirms logout.
    LogoutReply {
        /// Agent id.
        agent_id: Uuid,
        /// Session id.
        session_id: Uuid,
    },
    /// Instant message.
    ImprovedInstantMessage {
        /// Sending agent.
        agent_id: Uuid,
        /// Session id.
        session_id: Uuid,
        /// Recipient.
        to_agent_id: Uuid,
        /// Dialog type.
        dialog: u8,
        /// Sender display name.
        from_name: String,
        /// Text.
        message: String,
    },
    /// Dedicated acknowledgment list.
    PacketAck {
        /// Acknowledged sequence numbers.
        sequences: Vec<u32>,
    },
    /// Peer is closing the circuit.
    CloseCircuit,
    /// Any other message, carried as a raw body.
    Generic {
        /// Wire identity.
        id: MessageId,
        /// Little-endian body, already encoded.
        body: Vec<u8>,
    },
}

impl Message {
    /// Returns the wire identity.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        match self {
            Self::StartPingCheck { .. } => MessageId::START_PING_CHECK,
            Self::CompletePingCheck { .. } => MessageId::COMPLETE_PING_CHECK,
            Self::LayerData { .. } => MessageId::LAYER_DATA,
            Self::ObjectUpdate { .. } => MessageId::OBJECT_UPDATE,
            Self::ImprovedTerseObjectUpdate { .. } => MessageId::IMPROVED_TERSE_OBJECT_UPDATE,
            Self::KillObject { .. } => MessageId::KILL_OBJECT,
            Self::UseCircuitCode { .. } => MessageId::USE_CIRCUIT_CODE,
            Self::ChatFromViewer { .. } => MessageId::CHAT_FROM_VIEWER,
            Self::AgentThrottle { .. } => MessageId::AGENT_THROTTLE,
            Self::ChatFromSimulator { .. } => MessageId::CHAT_FROM_SIMULATOR,
            Self::SimStats { .. } => MessageId::SIM_STATS,
            Self::RegionHandshake { .. } => MessageId::REGION_HANDSHAKE,
            Self::RegionHandshakeReply { .. } => MessageId::REGION_HANDSHAKE_REPLY,
            Self::CompleteAgentMovement { .. } => MessageId::COMPLETE_AGENT_MOVEMENT,
            Self::AgentMovementComplete { .. } => MessageId::AGENT_MOVEMENT_COMPLETE,
            Self::LogoutRequest { .. } => MessageId::LOGOUT_REQUEST,
            Self::LogoutReply { .. } => MessageId::LOGOUT_REPLY,
            Self::ImprovedInstantMessage { .. } => MessageId::IMPROVED_INSTANT_MESSAGE,
            Self::PacketAck { .. } => MessageId::PACKET_ACK,
            Self::CloseCircuit => MessageId::CLOSE_CIRCUIT,
            Self::Generic { id, .. } => *id,
        }
    }

    /// Returns the protocol name, for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StartPingCheck { .. } => "StartPingCheck",
            Self::CompletePingCheck { .. } => "CompletePingCheck",
            Self::LayerData { .. } => "LayerData",
            Self::ObjectUpdate { .. } => "ObjectUpdate",
            Self::ImprovedTerseObjectUpdate { .. } => "ImprovedTerseObjectUpdate",
            Self::KillObject { .. } => "KillObject",
            Self::UseCircuitCode { .. } => "UseCircuitCode",
            Self::ChatFromViewer { .. } => "ChatFromViewer",
            Self::AgentThrottle { .. } => "AgentThrottle",
            Self::ChatFromSimulator { .. } => "ChatFromSimulator",
            Self::SimStats { .. } => "SimStats",
            Self::RegionHandshake { .. } => "RegionHandshake",
            Self::RegionHandshakeReply { .. } => "RegionHandshakeReply",
            Self::CompleteAgentMovement { .. } => "CompleteAgentMovement",
            Self::AgentMovementComplete { .. } => "AgentMovementComplete",
            Self::LogoutRequest { .. } => "LogoutRequest",
            Self::LogoutReply { .. } => "LogoutReply",
            Self::ImprovedInstantMessage { .. } => "ImprovedInstantMessage",
            Self::PacketAck { .. } => "PacketAck",
            Self::CloseCircuit => "CloseCircuit",
            Self::Generic { .. } => "Generic",
        }
    }

    /// Whether the message is sent reliably unless the caller overrides it.
    #[must_use]
    pub const fn is_reliable_by_default(&self) -> bool {
        !matches!(
            self,
            Self::StartPingCheck { .. }
                | Self::CompletePingCheck { .. }
                | Self::ImprovedTerseObjectUpdate { .. }
                | Self::SimStats { .. }
                | Self::PacketAck { .. }
                | Self::CloseCircuit
        )
    }

    /// Whether the message is a candidate for zero-run compression.
    #[must_use]
    pub const fn is_zero_coded(&self) -> bool {
        matches!(
            self,
            Self::ObjectUpdate { .. }
                | Self::ChatFromViewer { .. }
                | Self::AgentThrottle { .. }
                | Self::RegionHandshake { .. }
                | Self::RegionHandshakeReply { .. }
                | Self::LogoutReply { .. }
                | Self::ImprovedInstantMessage { .. }
        )
    }

    /// Writes tag and body.
    pub fn encode(&self, w: &mut PacketWriter) {
        self.id().write_tag(w);
        match self {
            Self::StartPingCheck {
                ping_id,
                oldest_unacked,
            } => {
                w.write_u8(*ping_id);
                w.write_u32(*oldest_unacked);
            }
            Self::CompletePingCheck { ping_id } => w.write_u8(*ping_id),
            Self::LayerData { layer_type, data } => {
                w.write_u8(*layer_type);
                w.write_blob(data);
            }
            Self::ObjectUpdate {
                region_handle,
                time_dilation,
                blocks,
            } => {
                w.write_u64(*region_handle);
                w.write_u16(*time_dilation);
                w.write_u8(blocks.len().min(255) as u8);
                for block in blocks.iter().take(255) {
                    w.write_blob(block);
                }
            }
            Self::ImprovedTerseObjectUpdate {
                region_handle,
                time_dilation,
                blocks,
            } => {
                w.write_u64(*region_handle);
                w.write_u16(*time_dilation);
                w.write_u8(blocks.len().min(255) as u8);
                for block in blocks.iter().take(255) {
                    let len = block.len().min(255);
                    w.write_u8(len as u8);
                    w.write_bytes(&block[..len]);
                }
            }
            Self::KillObject { local_ids } => {
                w.write_u8(local_ids.len().min(255) as u8);
                for id in local_ids.iter().take(255) {
                    w.write_u32(*id);
                }
            }
            Self::UseCircuitCode {
                code,
                session_id,
                agent_id,
            } => {
                w.write_u32(*code);
                w.write_uuid(session_id);
                w.write_uuid(agent_id);
            }
            Self::ChatFromViewer {
                agent_id,
                session_id,
                message,
                chat_type,
                channel,
            } => {
                w.write_uuid(agent_id);
                w.write_uuid(session_id);
                w.write_string(message);
                w.write_u8(*chat_type);
                w.write_i32(*channel);
            }
            Self::AgentThrottle {
                agent_id,
                session_id,
                circuit_code,
                gen_counter,
                throttles,
            } => {
                w.write_uuid(agent_id);
                w.write_uuid(session_id);
                w.write_u32(*circuit_code);
                w.write_u32(*gen_counter);
                w.write_u8((THROTTLE_CATEGORIES * 4) as u8);
                for value in throttles {
                    w.write_f32(*value);
                }
            }
            Self::ChatFromSimulator {
                from_name,
                source_id,
                owner_id,
                source_type,
                chat_type,
                audible,
                position,
                message,
            } => {
                w.write_string(from_name);
                w.write_uuid(source_id);
                w.write_uuid(owner_id);
                w.write_u8(*source_type);
                w.write_u8(*chat_type);
                w.write_u8(*audible);
                for axis in position {
                    w.write_f32(*axis);
                }
                w.write_string(message);
            }
            Self::SimStats {
                region_x,
                region_y,
                region_flags,
                object_capacity,
                stats,
            } => {
                w.write_u32(*region_x);
                w.write_u32(*region_y);
                w.write_u32(*region_flags);
                w.write_u32(*object_capacity);
                w.write_u8(stats.len().min(255) as u8);
                for (id, value) in stats.iter().take(255) {
                    w.write_u32(*id);
                    w.write_f32(*value);
                }
            }
            Self::RegionHandshake {
                region_flags,
                sim_access,
                region_name,
                region_id,
            } => {
                w.write_u32(*region_flags);
                w.write_u8(*sim_access);
                w.write_string(region_name);
                w.write_uuid(region_id);
            }
            Self::RegionHandshakeReply {
                agent_id,
                session_id,
                flags,
            } => {
                w.write_uuid(agent_id);
                w.write_uuid(session_id);
                w.write_u32(*flags);
            }
            Self::CompleteAgentMovement {
                agent_id,
                session_id,
                circuit_code,
            } => {
                w.write_uuid(agent_id);
                w.write_uuid(session_id);
                w.write_u32(*circuit_code);
            }
            Self::AgentMovementComplete {
                agent_id,
                session_id,
                region_handle,
                timestamp,
            } => {
                w.write_uuid(agent_id);
                w.write_uuid(session_id);
                w.write_u64(*region_handle);
                w.write_u32(*timestamp);
            }
            Self::LogoutRequest {
                agent_id,
                session_id,
            }
            | Self::LogoutReply {
                agent_id,
                session_id,
            } => {
                w.write_uuid(agent_id);
                w.write_uuid(session_id);
            }
            Self::ImprovedInstantMessage {
                agent_id,
                session_id,
                to_agent_id,
                dialog,
                from_name,
                message,
            } => {
                w.write_uuid(agent_id);
                w.write_uuid(session_id);
                w.write_uuid(to_agent_id);
                w.write_u8(*dialog);
                w.write_string(from_name);
                w.write_string(message);
            }
            Self::PacketAck { sequences } => {
                w.write_u8(sequences.len().min(255) as u8);
                for seq in sequences.iter().take(255) {
                    w.write_u32(*seq);
                }
            }
            Self::CloseCircuit => {}
            Self::Generic { body, .. } => w.write_bytes(body),
        }
    }

    /// Reads tag and body. Trailing bytes after a typed body are ignored.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if any field overruns the buffer or a string
    /// is not UTF-8.
    pub fn decode(r: &mut PacketReader<'_>) -> NetResult<Self> {
        let id = MessageId::read_tag(r)?;
        let message = match id {
            MessageId::START_PING_CHECK => Self::StartPingCheck {
                ping_id: r.read_u8()?,
                oldest_unacked: r.read_u32()?,
            },
            MessageId::COMPLETE_PING_CHECK => Self::CompletePingCheck {
                ping_id: r.read_u8()?,
            },
            MessageId::LAYER_DATA => Self::LayerData {
                layer_type: r.read_u8()?,
                data: r.read_blob()?.to_vec(),
            },
            MessageId::OBJECT_UPDATE => {
                let region_handle = r.read_u64()?;
                let time_dilation = r.read_u16()?;
                let count = r.read_u8()?;
                let blocks = (0..count)
                    .map(|_| r.read_blob().map(<[u8]>::to_vec))
                    .collect::<NetResult<_>>()?;
                Self::ObjectUpdate {
                    region_handle,
                    time_dilation,
                    blocks,
                }
            }
            MessageId::IMPROVED_TERSE_OBJECT_UPDATE => {
                let region_handle = r.read_u64()?;
                let time_dilation = r.read_u16()?;
                let count = r.read_u8()?;
                let blocks = (0..count)
                    .map(|_| -> NetResult<Arc<[u8]>> {
                        let len = usize::from(r.read_u8()?);
                        r.read_bytes(len).map(Arc::<[u8]>::from)
                    })
                    .collect::<NetResult<_>>()?;
                Self::ImprovedTerseObjectUpdate {
                    region_handle,
                    time_dilation,
                    blocks,
                }
            }
            MessageId::KILL_OBJECT => {
                let count = r.read_u8()?;
                let local_ids = (0..count).map(|_| r.read_u32()).collect::<NetResult<_>>()?;
                Self::KillObject { local_ids }
            }
            MessageId::USE_CIRCUIT_CODE => Self::UseCircuitCode {
                code: r.read_u32()?,
                session_id: r.read_uuid()?,
                agent_id: r.read_uuid()?,
            },
            MessageId::CHAT_FROM_VIEWER => Self::ChatFromViewer {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                message: r.read_string()?,
                chat_type: r.read_u8()?,
                channel: r.read_i32()?,
            },
            MessageId::AGENT_THROTTLE => {
                let agent_id = r.read_uuid()?;
                let session_id = r.read_uuid()?;
                let circuit_code = r.read_u32()?;
                let gen_counter = r.read_u32()?;
                let len = usize::from(r.read_u8()?);
                if len < THROTTLE_CATEGORIES * 4 {
                    return Err(NetError::MalformedPacket("throttle block too short"));
                }
                let mut block = PacketReader::new(r.read_bytes(len)?);
                let mut throttles = [0.0f32; THROTTLE_CATEGORIES];
                for value in &mut throttles {
                    *value = block.read_f32()?;
                }
                Self::AgentThrottle {
                    agent_id,
                    session_id,
                    circuit_code,
                    gen_counter,
                    throttles,
                }
            }
            MessageId::CHAT_FROM_SIMULATOR => Self::ChatFromSimulator {
                from_name: r.read_string()?,
                source_id: r.read_uuid()?,
                owner_id: r.read_uuid()?,
                source_type: r.read_u8()?,
                chat_type: r.read_u8()?,
                audible: r.read_u8()?,
                position: [r.read_f32()?, r.read_f32()?, r.read_f32()?],
                message: r.read_string()?,
            },
            MessageId::SIM_STATS => {
                let region_x = r.read_u32()?;
                let region_y = r.read_u32()?;
                let region_flags = r.read_u32()?;
                let object_capacity = r.read_u32()?;
                let count = r.read_u8()?;
                let stats = (0..count)
                    .map(|_| -> NetResult<(u32, f32)> { Ok((r.read_u32()?, r.read_f32()?)) })
                    .collect::<NetResult<_>>()?;
                Self::SimStats {
                    region_x,
                    region_y,
                    region_flags,
                    object_capacity,
                    stats,
                }
            }
            MessageId::REGION_HANDSHAKE => Self::RegionHandshake {
                region_flags: r.read_u32()?,
                sim_access: r.read_u8()?,
                region_name: r.read_string()?,
                region_id: r.read_uuid()?,
            },
            MessageId::REGION_HANDSHAKE_REPLY => Self::RegionHandshakeReply {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                flags: r.read_u32()?,
            },
            MessageId::COMPLETE_AGENT_MOVEMENT => Self::CompleteAgentMovement {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                circuit_code: r.read_u32()?,
            },
            MessageId::AGENT_MOVEMENT_COMPLETE => Self::AgentMovementComplete {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                region_handle: r.read_u64()?,
                timestamp: r.read_u32()?,
            },
            MessageId::LOGOUT_REQUEST => Self::LogoutRequest {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
            },
            MessageId::LOGOUT_REPLY => Self::LogoutReply {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
            },
            MessageId::IMPROVED_INSTANT_MESSAGE => Self::ImprovedInstantMessage {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                to_agent_id: r.read_uuid()?,
                dialog: r.read_u8()?,
                from_name: r.read_string()?,
                message: r.read_string()?,
            },
            MessageId::PACKET_ACK => {
                let count = r.read_u8()?;
                let sequences = (0..count).map(|_| r.read_u32()).collect::<NetResult<_>>()?;
                Self::PacketAck { sequences }
            }
            MessageId::CLOSE_CIRCUIT => Self::CloseCircuit,
            other => Self::Generic {
                id: other,
                body: r.read_rest().to_vec(),
            },
        };
        Ok(message)
    }
}
