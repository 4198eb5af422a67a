//! # Transport Layer
//!
//! The UDP socket and the seam the rest of the crate sends through.
//!
//! ## Design
//!
//! - One socket per simulator, shared by reference across circuit threads
//! - Blocking receive with a read timeout so the owner can poll a stop flag
//! - Lock-free counters for packet statistics

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Anything that can put a datagram on the wire.
///
/// The server holds an `Arc<dyn DatagramSink>`; tests substitute a recorder.
pub trait DatagramSink: Send + Sync {
    /// Sends one datagram.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

/// UDP socket wrapper.
///
/// This is a thin wrapper around std UDP with:
/// - Read timeout instead of busy polling
/// - Packet statistics
#[derive(Debug)]
pub struct UdpTransport {
    /// The underlying socket.
    socket: UdpSocket,
    /// Local address.
    local_addr: SocketAddr,
    /// Statistics.
    stats: TransportStats,
}

/// Transport statistics.
#[derive(Debug, Default)]
pub struct TransportStats {
    /// Packets sent.
    pub packets_sent: AtomicU64,
    /// Packets received.
    pub packets_received: AtomicU64,
    /// Bytes sent.
    pub bytes_sent: AtomicU64,
    /// Bytes received.
    pub bytes_received: AtomicU64,
    /// Send errors.
    pub send_errors: AtomicU64,
}

impl UdpTransport {
    /// Binds a socket whose `recv_from` gives up after `read_timeout`.
    ///
    /// # Errors
    ///
    /// Returns the socket error if binding or configuring fails.
    pub fn bind(addr: SocketAddr, read_timeout: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(read_timeout.max(Duration::from_millis(1))))?;
        let local_addr = socket.local_addr()?;

        tracing::info!(%local_addr, "UDP transport bound");

        Ok(Self {
            socket,
            local_addr,
            stats: TransportStats::default(),
        })
    }

    /// Returns the local address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receives one datagram into `buffer`.
    ///
    /// Returns `Ok(None)` when the read timeout elapses with nothing to read.
    ///
    /// # Errors
    ///
    /// Returns any socket error other than a timeout.
    pub fn recv_from(&self, buffer: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buffer) {
            Ok((len, addr)) => {
                self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                Ok(Some((len, addr)))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            // Windows reports ICMP port-unreachable from an earlier send here.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns statistics.
    #[must_use]
    pub const fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

impl DatagramSink for UdpTransport {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.socket.send_to(data, addr) {
            Ok(n) => {
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}
