//! The threaded server over a real loopback socket.

use std::net::UdpSocket;
use std::thread;
use std::time::{Duration, Instant};

use lludp_networking::protocol::{decode, encode_to_vec};
use lludp_networking::{
    CircuitState, LludpServer, Message, MessageId, ServerConfig, Services, WorkerMode,
};
use uuid::Uuid;

#[test]
fn test_handshake_over_loopback() {
    let config = ServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        recv_timeout_ms: 20,
        worker_mode: WorkerMode::Threaded,
        ..ServerConfig::default()
    };
    let server = LludpServer::bind(config, Services::default()).unwrap();
    let server_addr = server.local_addr().unwrap();
    let session = Uuid::new_v4();
    let agent = Uuid::new_v4();
    let circuit = server.register_pending(77, session, agent);

    let runner = server.clone();
    let loop_handle = thread::spawn(move || runner.run());

    let viewer = UdpSocket::bind("127.0.0.1:0").unwrap();
    viewer
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let handshake = encode_to_vec(
        &Message::UseCircuitCode {
            code: 77,
            session_id: session,
            agent_id: agent,
        },
        1,
        true,
        &[],
    )
    .unwrap();
    viewer.send_to(&handshake, server_addr).unwrap();

    let mut acked = false;
    let mut region = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buffer = [0u8; 1500];
    while !(acked && region) && Instant::now() < deadline {
        let Ok((len, _)) = viewer.recv_from(&mut buffer) else {
            continue;
        };
        let packet = decode(&buffer[..len]).unwrap();
        match packet.message {
            Message::PacketAck { ref sequences } if sequences.contains(&1) => acked = true,
            ref m if m.id() == MessageId::REGION_HANDSHAKE => region = true,
            _ => {}
        }
    }
    assert!(acked, "handshake was not acked");
    assert!(region, "RegionHandshake not received");
    assert_eq!(circuit.state(), CircuitState::Active);

    server.shutdown();
    loop_handle.join().unwrap().unwrap();
    assert_eq!(circuit.state(), CircuitState::Closed);
    assert_eq!(server.circuit_count(), 0);
}

#[test]
fn test_run_without_socket_is_an_error() {
    let server = LludpServer::with_sink(
        ServerConfig::default(),
        Services::default(),
        std::sync::Arc::new(NullSink),
        std::sync::Arc::new(lludp_core::SystemClock::new()),
    );
    assert!(matches!(
        server.run(),
        Err(lludp_networking::NetError::NotConnected)
    ));
}

struct NullSink;

impl lludp_networking::DatagramSink for NullSink {
    fn send_to(&self, data: &[u8], _addr: std::net::SocketAddr) -> std::io::Result<usize> {
        Ok(data.len())
    }
}
