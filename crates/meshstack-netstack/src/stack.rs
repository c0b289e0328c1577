//! The userspace stack: one smoltcp interface, one NIC, one route.
//!
//! A driver task owns the polling loop. Each round it moves queued inbound
//! packets into the device, polls the interface, reaps finished sockets and
//! hands whatever was emitted to [`LinkEndpoint::write_packets`] under the
//! NIC's async mutex. Sockets wake the driver through a shared [`Notify`]
//! after every change they make.

use crate::config::{NicId, StackConfig};
use crate::device::OverlayDevice;
use crate::error::StackError;
use crate::nic::{LinkEndpoint, LinkHealth, LinkStats, PacketDispatcher};
use crate::packet::{IPV6_MIN_MTU, IPV6_PROTOCOL_NUMBER, PacketView, is_echo_request_to};
use bytes::Bytes;
use meshstack_core::{OverlayEngine, is_overlay_ip, overlay_network};
use parking_lot::Mutex;
use rand::Rng;
use smoltcp::iface::{Config, Interface, Route, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// First port handed out for ephemeral binds
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Driver sleep when no socket has a pending timer
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// An installed route as reported by [`NetStack::routes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    /// Destination network address
    pub destination: IpAddr,
    /// Destination prefix length
    pub prefix_len: u8,
    /// Address the route is bound through (the NIC's own address)
    pub via: IpAddr,
    /// NIC the route belongs to
    pub nic_id: NicId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Proto {
    Tcp,
    Udp,
}

/// Local ports in use, per transport protocol
#[derive(Debug, Default)]
pub(crate) struct PortTable {
    used: HashSet<(Proto, u16)>,
}

impl PortTable {
    /// Reserve `port`, or an ephemeral port when `port` is 0
    pub(crate) fn reserve(&mut self, proto: Proto, port: u16) -> Option<u16> {
        if port != 0 {
            return self.used.insert((proto, port)).then_some(port);
        }

        let span = u32::from(u16::MAX - EPHEMERAL_PORT_START) + 1;
        let offset = rand::thread_rng().gen_range(0..span);
        (0..span)
            .map(|i| EPHEMERAL_PORT_START + ((offset + i) % span) as u16)
            .find(|candidate| self.used.insert((proto, *candidate)))
    }

    pub(crate) fn release(&mut self, proto: Proto, port: u16) {
        self.used.remove(&(proto, port));
    }
}

/// Socket that outlived its handle and is waiting to finish.
///
/// TCP sockets are reaped once fully closed, UDP sockets once their send
/// queue has drained.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Orphan {
    pub(crate) handle: SocketHandle,
    pub(crate) proto: Proto,
    /// Port to release once the socket is gone
    pub(crate) port: Option<u16>,
}

/// Everything the driver and the sockets mutate under one lock
pub(crate) struct StackCore {
    pub(crate) iface: Interface,
    pub(crate) device: OverlayDevice,
    pub(crate) sockets: SocketSet<'static>,
    pub(crate) ports: PortTable,
    orphans: Vec<Orphan>,
}

impl StackCore {
    pub(crate) fn orphan(&mut self, orphan: Orphan) {
        self.orphans.push(orphan);
    }

    fn reap_orphans(&mut self) {
        let sockets = &mut self.sockets;
        let ports = &mut self.ports;
        self.orphans.retain(|orphan| {
            let finished = match orphan.proto {
                Proto::Tcp => {
                    sockets.get::<tcp::Socket>(orphan.handle).state() == tcp::State::Closed
                }
                Proto::Udp => sockets.get::<udp::Socket>(orphan.handle).send_queue() == 0,
            };
            if !finished {
                return true;
            }
            sockets.remove(orphan.handle);
            if let Some(port) = orphan.port {
                ports.release(orphan.proto, port);
            }
            trace!(handle = ?orphan.handle, "reaped closed socket");
            false
        });
    }

    fn shutdown_sockets(&mut self) {
        for (_, socket) in self.sockets.iter_mut() {
            match socket {
                smoltcp::socket::Socket::Tcp(tcp) => tcp.abort(),
                smoltcp::socket::Socket::Udp(udp) => udp.close(),
                _ => {}
            }
        }
    }
}

/// Inbound packets waiting for the driver.
///
/// This is what the NIC delivers into. It never blocks the reader: when the
/// queue is full the packet is dropped and counted, as a congested link
/// would.
pub(crate) struct InboundQueue {
    queue: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    wake: Arc<Notify>,
    local: Ipv6Addr,
    filter_local_echo: bool,
    dropped: AtomicU64,
}

impl InboundQueue {
    fn drain(&self) -> Vec<Bytes> {
        self.queue.lock().drain(..).collect()
    }
}

impl PacketDispatcher for InboundQueue {
    fn deliver_network_packet(&self, protocol: u16, packet: Bytes) {
        if protocol != IPV6_PROTOCOL_NUMBER {
            trace!(protocol, "ignoring non-IPv6 packet");
            return;
        }
        if self.filter_local_echo && is_echo_request_to(&packet, self.local) {
            trace!("local echo handling disabled, dropping echo request");
            return;
        }

        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(capacity = self.capacity, "inbound queue full, dropping packet");
                return;
            }
            queue.push_back(packet);
        }
        self.wake.notify_one();
    }
}

/// State shared by the stack handle, its sockets and the driver
pub(crate) struct StackShared {
    pub(crate) config: StackConfig,
    pub(crate) local_addr: Ipv6Addr,
    mtu: usize,
    routes: Vec<RouteEntry>,
    pub(crate) core: Mutex<StackCore>,
    wake: Arc<Notify>,
    inbound: Arc<InboundQueue>,
    nic: tokio::sync::Mutex<LinkEndpoint>,
    health: LinkHealth,
    closed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl StackShared {
    /// Ask the driver for another round
    pub(crate) fn wake_driver(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// One driver round: absorb inbound, poll, reap, collect outbound
    fn poll_once(&self) -> (Vec<PacketView>, Option<Duration>) {
        let mut guard = self.core.lock();
        let core = &mut *guard;

        core.device.push_rx(self.inbound.drain());
        let now = smoltcp::time::Instant::now();
        let _ = core.iface.poll(now, &mut core.device, &mut core.sockets);
        core.reap_orphans();

        let batch = core.device.take_tx();
        let delay = if core.device.has_pending_rx() {
            Some(Duration::ZERO)
        } else {
            core.iface
                .poll_delay(smoltcp::time::Instant::now(), &core.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
        };
        (batch, delay)
    }
}

impl Drop for StackShared {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

async fn drive(shared: Weak<StackShared>, wake: Arc<Notify>, nic_id: NicId) {
    debug!(nic = %nic_id, "stack driver started");
    loop {
        let delay = {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if shared.is_closed() {
                break;
            }

            let (batch, delay) = shared.poll_once();
            if !batch.is_empty() {
                trace!(nic = %nic_id, packets = batch.len(), "flushing outbound batch");
                let mut nic = shared.nic.lock().await;
                if let Err(e) = nic.write_packets(&batch).await {
                    warn!(
                        nic = %nic_id,
                        written = e.written(),
                        dropped = batch.len() - e.written(),
                        error = %e,
                        "outbound batch cut short"
                    );
                }
            }
            delay
        };

        match delay {
            Some(delay) if delay.is_zero() => tokio::task::yield_now().await,
            delay => {
                tokio::select! {
                    () = wake.notified() => {}
                    () = tokio::time::sleep(delay.unwrap_or(IDLE_POLL_INTERVAL)) => {}
                }
            }
        }
    }
    debug!(nic = %nic_id, "stack driver stopped");
}

/// Userspace TCP/IP stack bound to an overlay engine.
///
/// Cloning is cheap; all clones drive the same stack. Sockets keep the
/// stack alive, so it shuts down once the last handle and socket are gone
/// or [`close`](Self::close) is called.
///
/// # Examples
///
/// ```no_run
/// use meshstack_core::{LoopbackEngine, PublicKey};
/// use meshstack_netstack::{NetStack, StackConfig};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let (engine, _peer) = LoopbackEngine::pair(
///     PublicKey::from_bytes([1; 32]),
///     PublicKey::from_bytes([2; 32]),
///     1500,
/// );
/// let stack = NetStack::new(&engine, StackConfig::default())?;
/// let _listener = stack.listen_tcp(format!("[{}]:9000", stack.local_addr()).parse()?)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NetStack {
    pub(crate) shared: Arc<StackShared>,
}

impl std::fmt::Debug for NetStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetStack")
            .field("nic_id", &self.shared.config.nic_id)
            .field("local_addr", &self.shared.local_addr)
            .field("mtu", &self.shared.mtu)
            .finish_non_exhaustive()
    }
}

impl NetStack {
    /// Build the stack over a live engine and start its tasks.
    ///
    /// Construction is all-or-nothing: on error no task is left running.
    ///
    /// # Errors
    ///
    /// - `StackError::NoRuntime` outside a Tokio runtime
    /// - `StackError::MtuTooSmall` if the transport MTU is below 1280
    /// - `StackError::AddressTableFull` / `RouteTableFull` if the interface
    ///   refuses the address or the overlay route
    pub fn new(engine: &dyn OverlayEngine, config: StackConfig) -> Result<Self, StackError> {
        tokio::runtime::Handle::try_current().map_err(|_| StackError::NoRuntime)?;

        let transport = engine.transport();
        let mtu = transport.mtu();
        if mtu < IPV6_MIN_MTU {
            return Err(StackError::MtuTooSmall {
                mtu,
                min: IPV6_MIN_MTU,
            });
        }

        let nic_id = config.nic_id;
        let local_addr = engine.address().ip();

        let mut device = OverlayDevice::new(mtu);
        let mut iface_config = Config::new(HardwareAddress::Ip);
        iface_config.random_seed = rand::random();
        let mut iface = Interface::new(iface_config, &mut device, smoltcp::time::Instant::now());

        // Forwarding mode: accept anything routed through our own address
        iface.set_any_ip(!config.handle_local);

        let mut address_ok = true;
        iface.update_ip_addrs(|addrs| {
            address_ok = addrs
                .push(IpCidr::new(IpAddress::from(local_addr), 128))
                .is_ok();
        });
        if !address_ok {
            return Err(StackError::AddressTableFull);
        }

        let (network, prefix_len) = overlay_network();
        let mut installed = None;
        iface.routes_mut().update(|routes| {
            let route = Route {
                cidr: IpCidr::new(IpAddress::from(network), prefix_len),
                via_router: IpAddress::from(local_addr),
                preferred_until: None,
                expires_at: None,
            };
            if routes.push(route).is_ok() {
                installed = Some(
                    routes
                        .iter()
                        .map(|route| RouteEntry {
                            destination: ip_from_smoltcp(route.cidr.address()),
                            prefix_len: route.cidr.prefix_len(),
                            via: ip_from_smoltcp(route.via_router),
                            nic_id,
                        })
                        .collect::<Vec<_>>(),
                );
            }
        });
        let routes = installed.ok_or(StackError::RouteTableFull)?;

        let wake = Arc::new(Notify::new());
        let inbound = Arc::new(InboundQueue {
            queue: Mutex::new(VecDeque::new()),
            capacity: config.inbound_queue,
            wake: wake.clone(),
            local: local_addr,
            filter_local_echo: !config.handle_local,
            dropped: AtomicU64::new(0),
        });

        let nic = LinkEndpoint::new(nic_id, transport);
        nic.attach(inbound.clone());
        let health = nic.health();

        let shared = Arc::new(StackShared {
            config,
            local_addr,
            mtu,
            routes,
            core: Mutex::new(StackCore {
                iface,
                device,
                sockets: SocketSet::new(Vec::new()),
                ports: PortTable::default(),
                orphans: Vec::new(),
            }),
            wake: wake.clone(),
            inbound,
            nic: tokio::sync::Mutex::new(nic),
            health,
            closed: AtomicBool::new(false),
            driver: Mutex::new(None),
        });

        let driver = tokio::spawn(drive(Arc::downgrade(&shared), wake, nic_id));
        *shared.driver.lock() = Some(driver);

        info!(
            nic = %nic_id,
            address = %local_addr,
            mtu,
            handle_local = shared.config.handle_local,
            "netstack up"
        );
        Ok(Self { shared })
    }

    /// The node's overlay address
    #[must_use]
    pub fn local_addr(&self) -> Ipv6Addr {
        self.shared.local_addr
    }

    /// Identifier of the stack's NIC
    #[must_use]
    pub fn nic_id(&self) -> NicId {
        self.shared.config.nic_id
    }

    /// Link MTU
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    /// Whether local echo handling is on
    #[must_use]
    pub fn handles_local(&self) -> bool {
        self.shared.config.handle_local
    }

    /// Installed routes; always exactly the overlay prefix through the NIC
    #[must_use]
    pub fn routes(&self) -> Vec<RouteEntry> {
        self.shared.routes.clone()
    }

    /// Protocol addresses assigned to the NIC
    #[must_use]
    pub fn protocol_addresses(&self) -> Vec<(IpAddr, u8)> {
        self.shared
            .core
            .lock()
            .iface
            .ip_addrs()
            .iter()
            .map(|cidr| (ip_from_smoltcp(cidr.address()), cidr.prefix_len()))
            .collect()
    }

    /// NIC counters
    #[must_use]
    pub fn link_stats(&self) -> LinkStats {
        self.shared.health.stats()
    }

    /// Inbound packets dropped because the driver fell behind
    #[must_use]
    pub fn inbound_dropped(&self) -> u64 {
        self.shared.inbound.dropped.load(Ordering::Relaxed)
    }

    /// False once the NIC's reader has stopped; the stack then needs rebuilding
    #[must_use]
    pub fn is_link_up(&self) -> bool {
        self.shared.health.is_up()
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Shut the stack down.
    ///
    /// Aborts every socket (pending reads and accepts wake with an error),
    /// stops the driver and closes the NIC.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.core.lock().shutdown_sockets();
        if let Some(driver) = self.shared.driver.lock().take() {
            driver.abort();
        }
        self.shared.nic.lock().await.close();
        info!(nic = %self.nic_id(), "netstack closed");
    }

    pub(crate) fn tcp_socket(&self) -> tcp::Socket<'static> {
        let config = &self.shared.config;
        tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; config.tcp_rx_buffer]),
            tcp::SocketBuffer::new(vec![0; config.tcp_tx_buffer]),
        )
    }

    pub(crate) fn udp_socket(&self) -> udp::Socket<'static> {
        let config = &self.shared.config;
        udp::Socket::new(
            udp::PacketBuffer::new(
                vec![udp::PacketMetadata::EMPTY; config.udp_packets],
                vec![0; config.udp_buffer],
            ),
            udp::PacketBuffer::new(
                vec![udp::PacketMetadata::EMPTY; config.udp_packets],
                vec![0; config.udp_buffer],
            ),
        )
    }
}

#[cfg(test)]
impl NetStack {
    /// Sockets still held by the interface and ports still reserved
    pub(crate) fn open_resources(&self) -> (usize, usize) {
        let core = self.shared.core.lock();
        (core.sockets.iter().count(), core.ports.used.len())
    }
}

/// Convert a smoltcp address into the std representation
pub(crate) fn ip_from_smoltcp(addr: IpAddress) -> IpAddr {
    match addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(v4.into()),
        IpAddress::Ipv6(v6) => IpAddr::V6(v6.into()),
    }
}

pub(crate) fn socket_addr_from_smoltcp(endpoint: IpEndpoint) -> SocketAddr {
    SocketAddr::new(ip_from_smoltcp(endpoint.addr), endpoint.port)
}

/// Remote endpoint on the overlay.
///
/// The interface only routes `200::/7`; a segment for any other destination
/// never leaves the stack, so those are refused up front.
pub(crate) fn overlay_endpoint(addr: SocketAddr) -> Result<IpEndpoint, StackError> {
    match addr {
        SocketAddr::V6(v6) if is_overlay_ip(v6.ip()) => {
            Ok(IpEndpoint::new(IpAddress::from(*v6.ip()), v6.port()))
        }
        SocketAddr::V6(_) => Err(StackError::NoRoute(addr)),
        SocketAddr::V4(_) => Err(StackError::Ipv4Unsupported(addr)),
    }
}

/// Local bind endpoint; the unspecified address accepts any destination
pub(crate) fn listen_endpoint(addr: SocketAddr, port: u16) -> Result<IpListenEndpoint, StackError> {
    match addr {
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => Ok(IpListenEndpoint { addr: None, port }),
        SocketAddr::V6(v6) => Ok(IpListenEndpoint {
            addr: Some(IpAddress::from(*v6.ip())),
            port,
        }),
        SocketAddr::V4(_) => Err(StackError::Ipv4Unsupported(addr)),
    }
}
