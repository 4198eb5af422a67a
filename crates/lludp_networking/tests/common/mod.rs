//! Shared fixtures: a recording socket, recording services and a manually
//! clocked, manually pumped server.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use lludp_core::ManualClock;
use lludp_networking::circuit::CircuitIdentity;
use lludp_networking::objects::encode_full_block;
use lludp_networking::protocol::{decode, encode_to_vec};
use lludp_networking::server::{
    ChatRequest, ChatService, InboundHandler, InstantMessage, InstantMessageService,
    PresenceService, SceneView,
};
use lludp_networking::{
    Circuit, CloseReason, DatagramSink, LludpServer, Message, ObjectPermissions,
    ObjectUpdateInfo, Packet, PrimFlags, ServerConfig, Services, WorkerMode,
};
use parking_lot::Mutex;
use uuid::Uuid;

pub const CODE: u32 = 1001;
pub const SESSION: Uuid = Uuid::from_u128(0x5E55);
pub const AGENT: Uuid = Uuid::from_u128(0xA6E7);

pub fn viewer_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], port))
}

/// Captures every datagram instead of sending it.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn raw_to(&self, addr: SocketAddr) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| *to == addr)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn packets_to(&self, addr: SocketAddr) -> Vec<Packet> {
        self.raw_to(addr)
            .iter()
            .map(|bytes| decode(bytes).expect("server sent an undecodable packet"))
            .collect()
    }

    pub fn messages_to(&self, addr: SocketAddr) -> Vec<Message> {
        self.packets_to(addr).into_iter().map(|p| p.message).collect()
    }

    /// Every sequence acked to `addr`, piggybacked or dedicated.
    pub fn acks_to(&self, addr: SocketAddr) -> Vec<u32> {
        let mut acks = Vec::new();
        for packet in self.packets_to(addr) {
            acks.extend(&packet.acks);
            if let Message::PacketAck { sequences } = packet.message {
                acks.extend(sequences);
            }
        }
        acks
    }
}

impl DatagramSink for RecordingSink {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        self.sent.lock().push((addr, data.to_vec()));
        Ok(data.len())
    }
}

/// Records presence, chat, IM and unrouted traffic.
#[derive(Default)]
pub struct Recorder {
    pub closed: Mutex<Vec<(CircuitIdentity, CloseReason)>>,
    pub logged_out: Mutex<Vec<CircuitIdentity>>,
    pub chat: Mutex<Vec<ChatRequest>>,
    pub instant_messages: Mutex<Vec<InstantMessage>>,
    pub inbound: Mutex<Vec<Message>>,
}

impl PresenceService for Recorder {
    fn agent_logged_out(&self, identity: &CircuitIdentity) {
        self.logged_out.lock().push(*identity);
    }

    fn circuit_closed(&self, identity: &CircuitIdentity, reason: CloseReason) {
        self.closed.lock().push((*identity, reason));
    }
}

impl ChatService for Recorder {
    fn chat_from_viewer(&self, request: ChatRequest) {
        self.chat.lock().push(request);
    }
}

impl InstantMessageService for Recorder {
    fn instant_message(&self, message: InstantMessage) {
        self.instant_messages.lock().push(message);
    }
}

impl InboundHandler for Recorder {
    fn handle(&self, _from: &CircuitIdentity, message: Message) {
        self.inbound.lock().push(message);
    }
}

/// A fixed scene: some entities plus one avatar per agent.
#[derive(Default)]
pub struct FixedScene {
    pub entities: Vec<ObjectUpdateInfo>,
    pub avatars: Vec<(Uuid, ObjectUpdateInfo)>,
}

impl SceneView for FixedScene {
    fn entities(&self) -> Vec<ObjectUpdateInfo> {
        self.entities.clone()
    }

    fn avatar(&self, agent_id: &Uuid) -> Option<ObjectUpdateInfo> {
        self.avatars
            .iter()
            .find(|(agent, _)| agent == agent_id)
            .map(|(_, info)| info.clone())
    }
}

pub struct Harness {
    pub server: LludpServer,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
    pub recorder: Arc<Recorder>,
}

pub fn harness() -> Harness {
    harness_with_scene(FixedScene::default())
}

pub fn harness_with_scene(scene: FixedScene) -> Harness {
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::new(0));
    let recorder = Arc::new(Recorder::default());
    let services = Services {
        presence: recorder.clone(),
        chat: recorder.clone(),
        instant_messages: recorder.clone(),
        scene: Arc::new(scene),
        inbound: Some(recorder.clone()),
        ..Services::default()
    };
    let config = ServerConfig {
        worker_mode: WorkerMode::Manual,
        ..ServerConfig::default()
    };
    let server = LludpServer::with_sink(config, services, sink.clone(), clock.clone());
    Harness {
        server,
        sink,
        clock,
        recorder,
    }
}

pub fn datagram(message: &Message, sequence: u32, reliable: bool) -> Vec<u8> {
    encode_to_vec(message, sequence, reliable, &[]).expect("test message encodes")
}

pub fn use_circuit_code(code: u32, session_id: Uuid, agent_id: Uuid) -> Vec<u8> {
    datagram(
        &Message::UseCircuitCode {
            code,
            session_id,
            agent_id,
        },
        1,
        true,
    )
}

impl Harness {
    /// Registers and handshakes a circuit, then runs one pump.
    pub fn connect(&self, code: u32, session_id: Uuid, agent_id: Uuid, port: u16) -> Arc<Circuit> {
        let circuit = self.server.register_pending(code, session_id, agent_id);
        self.server
            .handle_datagram(&use_circuit_code(code, session_id, agent_id), viewer_addr(port));
        self.server.pump();
        circuit
    }

    pub fn connect_default(&self) -> Arc<Circuit> {
        self.connect(CODE, SESSION, AGENT, 5000)
    }

    pub fn send_from(&self, port: u16, message: &Message, sequence: u32, reliable: bool) {
        self.server
            .handle_datagram(&datagram(message, sequence, reliable), viewer_addr(port));
    }
}

/// An entity owned by `owner` with a full block of `body_len` extra bytes.
pub fn entity(local_id: u32, owner: Uuid, serial: u32, body_len: usize) -> ObjectUpdateInfo {
    ObjectUpdateInfo {
        local_id,
        owner_id: owner,
        killed: false,
        physical: false,
        serial,
        full: encode_full_block(
            local_id,
            PrimFlags::TOUCH,
            &owner,
            &vec![0x11; body_len],
        ),
        terse: Arc::from(vec![0x22; 60]),
        permissions: ObjectPermissions {
            owner_mask: lludp_networking::objects::PermissionMask::all(),
            everyone_mask: lludp_networking::objects::PermissionMask::MOVE,
        },
    }
}
