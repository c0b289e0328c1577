//! In-memory overlay for tests and self-checks.
//!
//! [`LoopbackTransport::pair`] returns two transports wired back to back:
//! whatever one writes, the other reads. [`LoopbackEngine`] wraps one end
//! with a key, a running flag and editable session/path tables.

use crate::address::PublicKey;
use crate::engine::{OverlayEngine, PathEntry, SessionEntry};
use crate::transport::{
    AtomicTransportStats, OverlayTransport, TransportError, TransportResult, TransportStats,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc, watch};

/// Packets in flight per direction before writers wait
const LOOPBACK_QUEUE_DEPTH: usize = 1024;

/// One end of an in-memory packet pipe
pub struct LoopbackTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    mtu: usize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    stats: AtomicTransportStats,
}

impl LoopbackTransport {
    /// Create two connected transports sharing one MTU
    #[must_use]
    pub fn pair(mtu: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(LOOPBACK_QUEUE_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(LOOPBACK_QUEUE_DEPTH);
        (Self::new(a_tx, a_rx, mtu), Self::new(b_tx, b_rx, mtu))
    }

    fn new(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>, mtu: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            mtu,
            shutdown_tx,
            shutdown_rx,
            stats: AtomicTransportStats::default(),
        }
    }

    /// Fail all current and future reads and writes on this end
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

#[async_trait]
impl OverlayTransport for LoopbackTransport {
    async fn read_packet(&self, buf: &mut [u8]) -> TransportResult<usize> {
        let mut shutdown = self.shutdown_rx.clone();
        if *shutdown.borrow_and_update() {
            self.stats.record_recv_error();
            return Err(TransportError::Closed);
        }

        let mut rx = self.rx.lock().await;
        let packet = tokio::select! {
            packet = rx.recv() => packet,
            _ = shutdown.wait_for(|down| *down) => None,
        };

        let Some(packet) = packet else {
            self.stats.record_recv_error();
            return Err(TransportError::Closed);
        };

        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        self.stats.record_recv(len);
        Ok(len)
    }

    async fn write_packet(&self, packet: &[u8]) -> TransportResult<usize> {
        if self.is_shut_down() {
            self.stats.record_send_error();
            return Err(TransportError::Closed);
        }
        if packet.len() > self.mtu {
            self.stats.record_send_error();
            return Err(TransportError::PacketTooLarge {
                len: packet.len(),
                mtu: self.mtu,
            });
        }

        if self.tx.send(packet.to_vec()).await.is_err() {
            self.stats.record_send_error();
            return Err(TransportError::Closed);
        }
        self.stats.record_send(packet.len());
        Ok(packet.len())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

/// Overlay engine backed by a loopback transport
pub struct LoopbackEngine {
    key: PublicKey,
    transport: Arc<LoopbackTransport>,
    running: AtomicBool,
    sessions: RwLock<Vec<SessionEntry>>,
    paths: RwLock<Vec<PathEntry>>,
}

impl LoopbackEngine {
    /// Wrap one end of a loopback pipe
    #[must_use]
    pub fn new(key: PublicKey, transport: LoopbackTransport) -> Self {
        Self {
            key,
            transport: Arc::new(transport),
            running: AtomicBool::new(true),
            sessions: RwLock::new(Vec::new()),
            paths: RwLock::new(Vec::new()),
        }
    }

    /// Two engines whose transports are wired to each other
    #[must_use]
    pub fn pair(key_a: PublicKey, key_b: PublicKey, mtu: usize) -> (Self, Self) {
        let (a, b) = LoopbackTransport::pair(mtu);
        (Self::new(key_a, a), Self::new(key_b, b))
    }

    /// The concrete transport, for shutdown and stats in tests
    #[must_use]
    pub fn loopback(&self) -> &Arc<LoopbackTransport> {
        &self.transport
    }

    /// Flip the running flag
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    /// Replace the session table
    pub fn set_sessions(&self, sessions: Vec<SessionEntry>) {
        *self.sessions.write() = sessions;
    }

    /// Replace the path table
    pub fn set_paths(&self, paths: Vec<PathEntry>) {
        *self.paths.write() = paths;
    }
}

impl OverlayEngine for LoopbackEngine {
    fn public_key(&self) -> PublicKey {
        self.key
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn transport(&self) -> Arc<dyn OverlayTransport> {
        self.transport.clone()
    }

    fn session_table(&self) -> Vec<SessionEntry> {
        self.sessions.read().clone()
    }

    fn path_table(&self) -> Vec<PathEntry> {
        self.paths.read().clone()
    }
}
