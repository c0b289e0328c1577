//! Raw packet transport exposed by the overlay engine.
//!
//! The overlay hands out whole IPv6 datagrams: one `read_packet` yields one
//! packet, one `write_packet` sends one. Nothing here knows about TCP or
//! UDP; that is the netstack's job.

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying overlay
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Packet exceeds the transport MTU
    #[error("Packet of {len} bytes exceeds MTU {mtu}")]
    PacketTooLarge {
        /// Packet length
        len: usize,
        /// Transport MTU
        mtu: usize,
    },

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Packet-level transport of the overlay engine.
///
/// Reads block until a packet arrives; a read error means the transport is
/// gone for good.
#[async_trait]
pub trait OverlayTransport: Send + Sync {
    /// Read one packet into `buf`, returning its length
    ///
    /// # Errors
    /// Returns `TransportError` if the overlay can no longer deliver packets
    async fn read_packet(&self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Write one packet, returning the number of bytes accepted
    ///
    /// # Errors
    /// Returns `TransportError` if the overlay rejects the packet
    async fn write_packet(&self, packet: &[u8]) -> TransportResult<usize>;

    /// Largest packet the overlay accepts
    fn mtu(&self) -> usize;

    /// Transport statistics (optional)
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

/// Lock-free counters backing `TransportStats`
#[derive(Debug, Default)]
pub struct AtomicTransportStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl AtomicTransportStats {
    /// Record a successful send
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful receive
    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send error
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive error
    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}
