//! Virtual NIC over the overlay's raw packet transport.
//!
//! The link endpoint owns two background tasks for its whole lifetime:
//!
//! ```text
//!  overlay ──read──> [reader task] ──deliver──> dispatcher (stack)
//!
//!  stack ──write_packets──┬──> write buffer ──> overlay
//!                         └──> reset queue (100) ──> [drain task] ──> overlay
//! ```
//!
//! Bare TCP resets are diverted to the drain task so that a burst of them
//! cannot hold up interactive traffic. The write buffer is only reachable
//! through `&mut self`, so the owner decides who may write.

use crate::config::NicId;
use crate::error::LinkError;
use crate::packet::{IPV6_PROTOCOL_NUMBER, PacketView};
use bytes::Bytes;
use meshstack_core::OverlayTransport;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the pending-reset queue
pub const RESET_QUEUE_CAPACITY: usize = 100;

/// Receiver of inbound packets
pub trait PacketDispatcher: Send + Sync {
    /// Hand one inbound datagram to the network layer
    fn deliver_network_packet(&self, protocol: u16, packet: Bytes);
}

type DispatcherSlot = Arc<RwLock<Option<Arc<dyn PacketDispatcher>>>>;

/// Link counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Packets read from the overlay
    pub packets_read: u64,
    /// Bytes read from the overlay
    pub bytes_read: u64,
    /// Packets written on the synchronous path
    pub packets_written: u64,
    /// Bytes written on the synchronous path
    pub bytes_written: u64,
    /// Resets diverted to the drain task
    pub resets_queued: u64,
    /// Resets written by the drain task
    pub resets_written: u64,
    /// Outbound packets dropped as malformed
    pub malformed_dropped: u64,
    /// Inbound packets read while no dispatcher was attached
    pub undelivered: u64,
}

#[derive(Debug, Default)]
struct AtomicLinkStats {
    packets_read: AtomicU64,
    bytes_read: AtomicU64,
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
    resets_queued: AtomicU64,
    resets_written: AtomicU64,
    malformed_dropped: AtomicU64,
    undelivered: AtomicU64,
}

impl AtomicLinkStats {
    fn snapshot(&self) -> LinkStats {
        LinkStats {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            resets_queued: self.resets_queued.load(Ordering::Relaxed),
            resets_written: self.resets_written.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            undelivered: self.undelivered.load(Ordering::Relaxed),
        }
    }
}

/// Shared view of the link's liveness and counters.
///
/// Readable without holding the NIC, so the owner can watch for a dead
/// reader while the write path is busy.
#[derive(Debug, Clone)]
pub struct LinkHealth {
    up: Arc<AtomicBool>,
    stats: Arc<AtomicLinkStats>,
}

impl LinkHealth {
    /// False once the reader task has hit a transport error
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> LinkStats {
        self.stats.snapshot()
    }
}

/// The virtual NIC
pub struct LinkEndpoint {
    nic_id: NicId,
    transport: Arc<dyn OverlayTransport>,
    mtu: usize,
    dispatcher: DispatcherSlot,
    write_buf: Vec<u8>,
    reset_tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    drainer: JoinHandle<()>,
    health: LinkHealth,
    closed: bool,
}

impl LinkEndpoint {
    /// Create the NIC and start its reader and reset-drain tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(nic_id: NicId, transport: Arc<dyn OverlayTransport>) -> Self {
        let mtu = transport.mtu();
        let dispatcher: DispatcherSlot = Arc::new(RwLock::new(None));
        let health = LinkHealth {
            up: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(AtomicLinkStats::default()),
        };
        let (reset_tx, reset_rx) = mpsc::channel(RESET_QUEUE_CAPACITY);

        let reader = tokio::spawn(read_loop(
            nic_id,
            transport.clone(),
            mtu,
            dispatcher.clone(),
            health.clone(),
        ));
        let drainer = tokio::spawn(drain_resets(
            nic_id,
            transport.clone(),
            reset_rx,
            health.clone(),
        ));

        info!(nic = %nic_id, mtu, "link endpoint up");

        Self {
            nic_id,
            transport,
            mtu,
            dispatcher,
            write_buf: Vec::with_capacity(mtu),
            reset_tx,
            reader,
            drainer,
            health,
            closed: false,
        }
    }

    /// Attach the dispatcher inbound packets are delivered to.
    ///
    /// Attaching again replaces the previous dispatcher.
    pub fn attach(&self, dispatcher: Arc<dyn PacketDispatcher>) {
        *self.dispatcher.write() = Some(dispatcher);
        debug!(nic = %self.nic_id, "dispatcher attached");
    }

    /// Whether a dispatcher is attached
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.dispatcher.read().is_some()
    }

    /// NIC identifier
    #[must_use]
    pub fn nic_id(&self) -> NicId {
        self.nic_id
    }

    /// Link MTU, taken from the overlay transport
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Liveness and counters handle
    #[must_use]
    pub fn health(&self) -> LinkHealth {
        self.health.clone()
    }

    /// Write a batch of outbound packets in order.
    ///
    /// Bare resets go to the pending-reset queue; when the queue is full this
    /// waits for the drain task to make room. Malformed packets are dropped
    /// and counted. Returns the number of packets handled.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Write` at the first overlay write failure, carrying
    /// the number of packets handled before it, or `LinkError::Closed` after
    /// [`close`](Self::close).
    pub async fn write_packets(&mut self, batch: &[PacketView]) -> Result<usize, LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }

        let stats = &self.health.stats;
        let mut handled = 0;
        for packet in batch {
            if packet.is_bare_reset() {
                stats.resets_queued.fetch_add(1, Ordering::Relaxed);
                if self.reset_tx.send(packet.to_bytes()).await.is_err() {
                    warn!(nic = %self.nic_id, "reset drain task has stopped, dropping reset");
                }
                handled += 1;
                continue;
            }

            let len = match packet.write_to(&mut self.write_buf) {
                Ok(len) => len,
                Err(e) => {
                    stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(nic = %self.nic_id, error = %e, "dropping malformed outbound packet");
                    handled += 1;
                    continue;
                }
            };

            if let Err(source) = self.transport.write_packet(&self.write_buf).await {
                return Err(LinkError::Write {
                    written: handled,
                    source,
                });
            }
            stats.packets_written.fetch_add(1, Ordering::Relaxed);
            stats.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
            trace!(nic = %self.nic_id, len, "packet written");
            handled += 1;
        }

        Ok(handled)
    }

    /// Detach the dispatcher and stop both background tasks
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        *self.dispatcher.write() = None;
        self.reader.abort();
        self.drainer.abort();
        info!(nic = %self.nic_id, "link endpoint closed");
    }
}

impl Drop for LinkEndpoint {
    fn drop(&mut self) {
        self.reader.abort();
        self.drainer.abort();
    }
}

async fn read_loop(
    nic_id: NicId,
    transport: Arc<dyn OverlayTransport>,
    mtu: usize,
    dispatcher: DispatcherSlot,
    health: LinkHealth,
) {
    let mut buf = vec![0u8; mtu];
    loop {
        let n = match transport.read_packet(&mut buf).await {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                health.up.store(false, Ordering::Release);
                error!(nic = %nic_id, error = %e, "overlay read failed, inbound traffic stopped");
                return;
            }
        };

        health.stats.packets_read.fetch_add(1, Ordering::Relaxed);
        health.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);

        let target = dispatcher.read().clone();
        match target {
            Some(target) => {
                let packet = Bytes::copy_from_slice(&buf[..n]);
                target.deliver_network_packet(IPV6_PROTOCOL_NUMBER, packet);
            }
            None => {
                health.stats.undelivered.fetch_add(1, Ordering::Relaxed);
                trace!(nic = %nic_id, len = n, "no dispatcher attached, packet dropped");
            }
        }
    }
}

async fn drain_resets(
    nic_id: NicId,
    transport: Arc<dyn OverlayTransport>,
    mut queue: mpsc::Receiver<Bytes>,
    health: LinkHealth,
) {
    while let Some(packet) = queue.recv().await {
        if let Err(e) = transport.write_packet(&packet).await {
            error!(nic = %nic_id, error = %e, "overlay write failed, reset drain stopped");
            return;
        }
        health.stats.resets_written.fetch_add(1, Ordering::Relaxed);
        trace!(nic = %nic_id, "reset written");
    }
}
