//! Entity update scheduling through the server.

mod common;

use common::{entity, harness, harness_with_scene, viewer_addr, FixedScene, AGENT, CODE, SESSION};
use lludp_networking::objects::{block_flags, FLAGS_OFFSET};
use lludp_networking::protocol::PacketWriter;
use lludp_networking::{Message, ObjectUpdateInfo, PrimFlags, MAX_PACKET_SIZE, MTU_BUDGET};
use uuid::Uuid;

const OTHER_SESSION: Uuid = Uuid::from_u128(0x0202);
const OTHER_AGENT: Uuid = Uuid::from_u128(0x0303);

fn object_messages(h: &common::Harness, port: u16) -> Vec<Message> {
    h.sink
        .messages_to(viewer_addr(port))
        .into_iter()
        .filter(|m| {
            matches!(
                m,
                Message::ObjectUpdate { .. }
                    | Message::ImprovedTerseObjectUpdate { .. }
                    | Message::KillObject { .. }
            )
        })
        .collect()
}

fn full_blocks(messages: &[Message]) -> Vec<Vec<u8>> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::ObjectUpdate { blocks, .. } => Some(blocks.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

fn local_id(block: &[u8]) -> u32 {
    u32::from_le_bytes([block[0], block[1], block[2], block[3]])
}

#[test]
fn test_region_entry_sends_scene_and_announces_avatar() {
    let scene = FixedScene {
        entities: (100..103).map(|id| entity(id, Uuid::nil(), 1, 32)).collect(),
        avatars: vec![(AGENT, entity(900, AGENT, 1, 48))],
    };
    let h = harness_with_scene(scene);
    h.connect(2002, OTHER_SESSION, OTHER_AGENT, 5001);
    h.connect_default();

    let movement = Message::CompleteAgentMovement {
        agent_id: AGENT,
        session_id: SESSION,
        circuit_code: CODE,
    };
    h.send_from(5000, &movement, 2, true);
    h.server.pump();

    let to_newcomer = h.sink.messages_to(viewer_addr(5000));
    assert!(to_newcomer
        .iter()
        .any(|m| matches!(m, Message::AgentMovementComplete { agent_id, .. } if *agent_id == AGENT)));
    let mut seen: Vec<u32> = full_blocks(&object_messages(&h, 5000))
        .iter()
        .map(|b| local_id(b))
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![100, 101, 102]);

    let announced: Vec<u32> = full_blocks(&object_messages(&h, 5001))
        .iter()
        .map(|b| local_id(b))
        .collect();
    assert_eq!(announced, vec![900]);

    // A repeated movement completion is answered but does not resend the scene.
    h.sink.clear();
    h.send_from(5000, &movement, 3, true);
    h.server.pump();
    assert!(h
        .sink
        .messages_to(viewer_addr(5000))
        .iter()
        .any(|m| matches!(m, Message::AgentMovementComplete { .. })));
    assert!(object_messages(&h, 5000).is_empty());
}

#[test]
fn test_full_then_terse_then_kill() {
    let h = harness();
    h.connect_default();
    let owner = Uuid::from_u128(0x0E);

    let step = |info: ObjectUpdateInfo| {
        h.sink.clear();
        h.server.schedule_update(&AGENT, info).unwrap();
        h.server.pump();
        object_messages(&h, 5000)
    };

    let first = step(entity(1, owner, 1, 20));
    assert!(matches!(&first[..], [Message::ObjectUpdate { .. }]));

    let moved = step(entity(1, owner, 1, 20));
    assert!(matches!(&moved[..], [Message::ImprovedTerseObjectUpdate { blocks, .. }] if blocks[0].len() == 60));

    let changed = step(entity(1, owner, 2, 20));
    assert!(matches!(&changed[..], [Message::ObjectUpdate { .. }]));

    let killed = step(ObjectUpdateInfo::killed(1));
    assert_eq!(killed, vec![Message::KillObject { local_ids: vec![1] }]);

    let recreated = step(entity(1, owner, 2, 20));
    assert!(matches!(&recreated[..], [Message::ObjectUpdate { .. }]));
}

#[test]
fn test_permission_patch_differs_only_in_flag_bytes() {
    let h = harness();
    h.connect_default();
    h.connect(2002, OTHER_SESSION, OTHER_AGENT, 5001);

    assert_eq!(h.server.broadcast_update(&entity(50, AGENT, 1, 64)), 2);
    h.server.pump();

    let owner_view = full_blocks(&object_messages(&h, 5000));
    let other_view = full_blocks(&object_messages(&h, 5001));
    assert_eq!(owner_view.len(), 1);
    assert_eq!(other_view.len(), 1);
    let (owner_view, other_view) = (&owner_view[0], &other_view[0]);
    assert_eq!(owner_view.len(), other_view.len());

    let differing: Vec<usize> = owner_view
        .iter()
        .zip(other_view)
        .enumerate()
        .filter(|(_, (a, b))| a != b)
        .map(|(i, _)| i)
        .collect();
    assert!(!differing.is_empty());
    assert!(differing
        .iter()
        .all(|i| (FLAGS_OFFSET..FLAGS_OFFSET + 4).contains(i)));

    let owner_flags = block_flags(owner_view).unwrap();
    let other_flags = block_flags(other_view).unwrap();
    assert!(owner_flags.contains(PrimFlags::OBJECT_YOU_OWNER | PrimFlags::OBJECT_MODIFY));
    assert!(!other_flags.contains(PrimFlags::OBJECT_YOU_OWNER));
    assert!(!other_flags.contains(PrimFlags::OBJECT_MODIFY));
    assert!(other_flags.contains(PrimFlags::OBJECT_MOVE | PrimFlags::TOUCH));
}

#[test]
fn test_batches_respect_mtu_budget() {
    let h = harness();
    h.connect_default();
    for id in 0..120 {
        h.server
            .schedule_update(&AGENT, entity(id, AGENT, 1, 150))
            .unwrap();
    }
    for id in 1_000..1_600 {
        h.server
            .schedule_update(&AGENT, ObjectUpdateInfo::killed(id))
            .unwrap();
    }
    // Each class sends a bounded number of packets per pass.
    for _ in 0..5 {
        h.server.pump();
    }

    for raw in h.sink.raw_to(viewer_addr(5000)) {
        assert!(raw.len() <= MAX_PACKET_SIZE);
    }
    let messages = object_messages(&h, 5000);
    for message in &messages {
        let mut body = PacketWriter::new();
        message.encode(&mut body);
        assert!(body.len() <= MTU_BUDGET, "{} is {} bytes", message.name(), body.len());
    }

    assert_eq!(full_blocks(&messages).len(), 120);
    let kills: Vec<usize> = messages
        .iter()
        .filter_map(|m| match m {
            Message::KillObject { local_ids } => Some(local_ids.len()),
            _ => None,
        })
        .collect();
    assert_eq!(kills, vec![250, 250, 100]);
}

#[test]
fn test_schedule_for_unknown_agent_fails() {
    let h = harness();
    assert!(h
        .server
        .schedule_update(&Uuid::from_u128(7), entity(1, Uuid::nil(), 1, 0))
        .is_err());
    assert_eq!(h.server.broadcast_update(&entity(1, Uuid::nil(), 1, 0)), 0);
}
