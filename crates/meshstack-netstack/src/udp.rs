//! UDP sockets on the userspace stack.

use crate::error::StackError;
use crate::stack::{
    NetStack, Orphan, Proto, listen_endpoint, overlay_endpoint, socket_addr_from_smoltcp,
};
use smoltcp::iface::SocketHandle;
use smoltcp::socket::udp;
use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

/// Bound UDP socket, optionally associated with one peer.
///
/// A socket obtained from [`NetStack::dial_udp`] is associated: [`send`]
/// goes to the peer and [`recv`] discards datagrams from anyone else.
///
/// [`send`]: UdpSocket::send
/// [`recv`]: UdpSocket::recv
pub struct UdpSocket {
    stack: NetStack,
    handle: SocketHandle,
    local: SocketAddr,
    peer: Option<SocketAddr>,
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

impl UdpSocket {
    /// Local endpoint
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Associated peer, if any
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Poll sending one datagram to `target`
    pub fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        data: &[u8],
        target: SocketAddr,
    ) -> Poll<io::Result<usize>> {
        let shared = &self.stack.shared;
        if shared.is_closed() {
            return Poll::Ready(Err(StackError::Closed.into()));
        }
        let endpoint = overlay_endpoint(target)?;

        let mut core = shared.core.lock();
        let socket = core.sockets.get_mut::<udp::Socket>(self.handle);
        if data.len() > socket.payload_send_capacity() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "datagram of {} bytes exceeds the {} byte send buffer",
                    data.len(),
                    socket.payload_send_capacity()
                ),
            )));
        }

        match socket.send_slice(data, endpoint) {
            Ok(()) => {
                drop(core);
                shared.wake_driver();
                trace!(to = %target, len = data.len(), "datagram queued");
                Poll::Ready(Ok(data.len()))
            }
            Err(udp::SendError::BufferFull) => {
                socket.register_send_waker(cx.waker());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("send to {target} failed: {e}"),
            ))),
        }
    }

    /// Poll receiving one datagram.
    ///
    /// Datagrams longer than `buf` are truncated. On an associated socket,
    /// datagrams from other senders are discarded.
    pub fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        let shared = &self.stack.shared;
        if shared.is_closed() {
            return Poll::Ready(Err(StackError::Closed.into()));
        }

        let mut core = shared.core.lock();
        let socket = core.sockets.get_mut::<udp::Socket>(self.handle);
        loop {
            match socket.recv_slice(buf) {
                Ok((n, meta)) => {
                    let from = socket_addr_from_smoltcp(meta.endpoint);
                    if self.peer.is_some_and(|peer| peer != from) {
                        trace!(from = %from, "discarding datagram from unassociated sender");
                        continue;
                    }
                    return Poll::Ready(Ok((n, from)));
                }
                Err(udp::RecvError::Exhausted) => {
                    socket.register_recv_waker(cx.waker());
                    return Poll::Pending;
                }
                Err(e) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        e.to_string(),
                    )));
                }
            }
        }
    }

    /// Send one datagram to `target`
    ///
    /// # Errors
    ///
    /// Fails for targets outside the overlay, oversized datagrams or a
    /// closed stack.
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        poll_fn(|cx| self.poll_send_to(cx, data, target)).await
    }

    /// Receive one datagram and its sender
    ///
    /// # Errors
    ///
    /// Fails once the stack is closed.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        poll_fn(|cx| self.poll_recv_from(cx, buf)).await
    }

    /// Send one datagram to the associated peer
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` on a socket without a peer.
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        let peer = self.require_peer()?;
        self.send_to(data, peer).await
    }

    /// Receive one datagram from the associated peer
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` on a socket without a peer.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.require_peer()?;
        self.recv_from(buf).await.map(|(n, _)| n)
    }

    fn require_peer(&self) -> io::Result<SocketAddr> {
        self.peer.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "UDP socket has no associated peer")
        })
    }
}

impl AsyncRead for UdpSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.require_peer()?;
        let n = match self.poll_recv_from(cx, buf.initialize_unfilled()) {
            Poll::Ready(Ok((n, _))) => n,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let peer = self.require_peer()?;
        self.poll_send_to(cx, data, peer)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        let shared = &self.stack.shared;
        shared.core.lock().orphan(Orphan {
            handle: self.handle,
            proto: Proto::Udp,
            port: Some(self.local.port()),
        });
        shared.wake_driver();
        debug!(local = %self.local, "UDP socket closed");
    }
}

impl NetStack {
    fn bind_udp(
        &self,
        addr: SocketAddr,
        peer: Option<SocketAddr>,
    ) -> Result<UdpSocket, StackError> {
        listen_endpoint(addr, addr.port())?;
        if self.shared.is_closed() {
            return Err(StackError::Closed);
        }

        let mut core = self.shared.core.lock();
        let port = core.ports.reserve(Proto::Udp, addr.port()).ok_or(if addr.port() == 0 {
            StackError::PortsExhausted
        } else {
            StackError::AddrInUse(addr)
        })?;

        let mut socket = self.udp_socket();
        if let Err(e) = socket.bind(listen_endpoint(addr, port)?) {
            core.ports.release(Proto::Udp, port);
            return Err(StackError::Bind {
                addr,
                reason: e.to_string(),
            });
        }
        let handle = core.sockets.add(socket);
        drop(core);

        let mut local = addr;
        local.set_port(port);
        debug!(local = %local, peer = ?peer, "UDP socket bound");
        Ok(UdpSocket {
            stack: self.clone(),
            handle,
            local,
            peer,
        })
    }

    /// Bind a UDP socket on `addr` (port 0 picks an ephemeral port)
    ///
    /// # Errors
    ///
    /// - `StackError::Ipv4Unsupported` for IPv4 addresses
    /// - `StackError::AddrInUse` if the port is taken
    pub fn listen_udp(&self, addr: SocketAddr) -> Result<UdpSocket, StackError> {
        self.bind_udp(addr, None)
    }

    /// Create a UDP socket associated with a pre-resolved overlay peer
    ///
    /// # Errors
    ///
    /// - `StackError::Ipv4Unsupported` for IPv4 peers
    /// - `StackError::NoRoute` for peers outside the overlay
    /// - `StackError::PortsExhausted` if no local port is free
    pub fn dial_udp(&self, peer: SocketAddr) -> Result<UdpSocket, StackError> {
        overlay_endpoint(peer)?;
        let local = SocketAddr::new(IpAddr::V6(self.shared.local_addr), 0);
        self.bind_udp(local, Some(peer))
    }
}
