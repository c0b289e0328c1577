//! TCP streams and listeners on the userspace stack.

use crate::error::StackError;
use crate::stack::{
    NetStack, Orphan, Proto, listen_endpoint, overlay_endpoint, socket_addr_from_smoltcp,
};
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp;
use smoltcp::wire::{IpAddress, IpListenEndpoint};
use std::future::poll_fn;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

/// Connected TCP stream.
///
/// Dropping the stream closes it gracefully; the stack finishes the FIN
/// exchange in the background and then frees the socket.
pub struct TcpStream {
    stack: NetStack,
    handle: SocketHandle,
    local: SocketAddr,
    peer: SocketAddr,
    /// Port owned by this stream (dialed streams only)
    port: Option<u16>,
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStream")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

impl TcpStream {
    /// Local endpoint
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Remote endpoint
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn closed_error() -> io::Error {
        StackError::Closed.into()
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let shared = &self.stack.shared;
        if shared.is_closed() {
            return Poll::Ready(Err(Self::closed_error()));
        }

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut core = shared.core.lock();
        let socket = core.sockets.get_mut::<tcp::Socket>(self.handle);
        match socket.recv_slice(buf.initialize_unfilled()) {
            Ok(0) => {
                socket.register_recv_waker(cx.waker());
                Poll::Pending
            }
            Ok(n) => {
                buf.advance(n);
                drop(core);
                // Window opened up
                shared.wake_driver();
                Poll::Ready(Ok(()))
            }
            // FIN from the peer and nothing left buffered
            Err(tcp::RecvError::Finished) => Poll::Ready(Ok(())),
            Err(tcp::RecvError::InvalidState) => {
                trace!(peer = %self.peer, state = %socket.state(), "read on aborted connection");
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    format!("connection to {} was reset", self.peer),
                )))
            }
        }
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let shared = &self.stack.shared;
        if shared.is_closed() {
            return Poll::Ready(Err(Self::closed_error()));
        }

        let mut core = shared.core.lock();
        let socket = core.sockets.get_mut::<tcp::Socket>(self.handle);
        if !socket.may_send() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if !socket.can_send() {
            socket.register_send_waker(cx.waker());
            return Poll::Pending;
        }

        let n = socket
            .send_slice(data)
            .map_err(|e| io::Error::other(e.to_string()))?;
        drop(core);
        shared.wake_driver();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let shared = &self.stack.shared;
        shared.core.lock().sockets.get_mut::<tcp::Socket>(self.handle).close();
        shared.wake_driver();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let shared = &self.stack.shared;
        {
            let mut core = shared.core.lock();
            core.sockets.get_mut::<tcp::Socket>(self.handle).close();
            core.orphan(Orphan {
                handle: self.handle,
                proto: Proto::Tcp,
                port: self.port,
            });
        }
        shared.wake_driver();
        trace!(peer = %self.peer, "stream dropped");
    }
}

/// Connect attempt in progress.
///
/// If the attempt is abandoned (cancelled or dropped) before completing,
/// the socket is aborted, which sends a reset, and handed to the reaper.
struct PendingSocket {
    stack: NetStack,
    handle: SocketHandle,
    port: u16,
    armed: bool,
}

impl PendingSocket {
    fn poll_established(
        &self,
        cx: &mut Context<'_>,
        remote: SocketAddr,
    ) -> Poll<Result<(), StackError>> {
        let shared = &self.stack.shared;
        if shared.is_closed() {
            return Poll::Ready(Err(StackError::Closed));
        }

        let mut core = shared.core.lock();
        let socket = core.sockets.get_mut::<tcp::Socket>(self.handle);
        match socket.state() {
            tcp::State::SynSent | tcp::State::SynReceived => {
                socket.register_send_waker(cx.waker());
                Poll::Pending
            }
            tcp::State::Closed | tcp::State::TimeWait => {
                Poll::Ready(Err(StackError::ConnectionRefused(remote)))
            }
            _ => Poll::Ready(Ok(())),
        }
    }

    fn into_stream(mut self, local: SocketAddr, peer: SocketAddr) -> TcpStream {
        self.armed = false;
        TcpStream {
            stack: self.stack.clone(),
            handle: self.handle,
            local,
            peer,
            port: Some(self.port),
        }
    }
}

impl Drop for PendingSocket {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let shared = &self.stack.shared;
        {
            let mut core = shared.core.lock();
            core.sockets.get_mut::<tcp::Socket>(self.handle).abort();
            core.orphan(Orphan {
                handle: self.handle,
                proto: Proto::Tcp,
                port: Some(self.port),
            });
        }
        shared.wake_driver();
        debug!(port = self.port, "connect attempt abandoned");
    }
}

/// Passive TCP endpoint with a small backlog of armed sockets
pub struct TcpListener {
    stack: NetStack,
    local: SocketAddr,
    endpoint: IpListenEndpoint,
    backlog: Vec<SocketHandle>,
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener")
            .field("local", &self.local)
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

impl TcpListener {
    /// Bound local endpoint (with the ephemeral port filled in)
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Wait for the next inbound connection
    ///
    /// # Errors
    ///
    /// Returns `StackError::Closed` if the stack shuts down while waiting.
    pub async fn accept(&mut self) -> Result<(TcpStream, SocketAddr), StackError> {
        poll_fn(|cx| self.poll_accept(cx)).await
    }

    /// Poll for an established connection in the backlog
    pub fn poll_accept(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(TcpStream, SocketAddr), StackError>> {
        let shared = self.stack.shared.clone();
        if shared.is_closed() {
            return Poll::Ready(Err(StackError::Closed));
        }

        let mut guard = shared.core.lock();
        let core = &mut *guard;

        let mut ready = None;
        for (slot, &handle) in self.backlog.iter().enumerate() {
            let socket = core.sockets.get_mut::<tcp::Socket>(handle);
            match socket.state() {
                tcp::State::Listen | tcp::State::SynReceived => {
                    socket.register_recv_waker(cx.waker());
                }
                _ => {
                    ready = Some((slot, handle, socket.local_endpoint(), socket.remote_endpoint()));
                    break;
                }
            }
        }
        let Some((slot, handle, local, remote)) = ready else {
            return Poll::Pending;
        };

        // Re-arm the slot before handing the connection out
        let mut fresh = self.stack.tcp_socket();
        match fresh.listen(self.endpoint) {
            Ok(()) => self.backlog[slot] = core.sockets.add(fresh),
            Err(e) => {
                debug!(local = %self.local, error = %e, "could not re-arm backlog slot");
                self.backlog.remove(slot);
            }
        }
        drop(guard);
        shared.wake_driver();

        let local = local.map_or(self.local, socket_addr_from_smoltcp);
        let peer = remote.map_or(
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0)),
            socket_addr_from_smoltcp,
        );
        debug!(local = %local, peer = %peer, "accepted connection");

        let stream = TcpStream {
            stack: self.stack.clone(),
            handle,
            local,
            peer,
            port: None,
        };
        Poll::Ready(Ok((stream, peer)))
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let shared = &self.stack.shared;
        {
            let mut core = shared.core.lock();
            for &handle in &self.backlog {
                core.sockets.get_mut::<tcp::Socket>(handle).abort();
                core.orphan(Orphan {
                    handle,
                    proto: Proto::Tcp,
                    port: None,
                });
            }
            core.ports.release(Proto::Tcp, self.endpoint.port);
        }
        shared.wake_driver();
        debug!(local = %self.local, "listener closed");
    }
}

impl NetStack {
    /// Open a TCP connection to a pre-resolved overlay endpoint.
    ///
    /// Waits until the handshake completes. Dropping the future aborts the
    /// attempt and releases the socket.
    ///
    /// # Errors
    ///
    /// - `StackError::Ipv4Unsupported` for IPv4 endpoints
    /// - `StackError::NoRoute` for endpoints outside the overlay
    /// - `StackError::PortsExhausted` if no local port is free
    /// - `StackError::Connect` if the stack refuses the endpoint
    /// - `StackError::ConnectionRefused` if the peer resets the attempt
    pub async fn dial_tcp(&self, addr: SocketAddr) -> Result<TcpStream, StackError> {
        let remote = overlay_endpoint(addr)?;
        if self.shared.is_closed() {
            return Err(StackError::Closed);
        }

        let local_ip = self.shared.local_addr;
        let (handle, port) = {
            let mut guard = self.shared.core.lock();
            let core = &mut *guard;
            let port = core
                .ports
                .reserve(Proto::Tcp, 0)
                .ok_or(StackError::PortsExhausted)?;

            let mut socket = self.tcp_socket();
            let local = IpListenEndpoint {
                addr: Some(IpAddress::from(local_ip)),
                port,
            };
            if let Err(e) = socket.connect(core.iface.context(), remote, local) {
                core.ports.release(Proto::Tcp, port);
                return Err(StackError::Connect {
                    addr,
                    reason: e.to_string(),
                });
            }
            (core.sockets.add(socket), port)
        };

        let pending = PendingSocket {
            stack: self.clone(),
            handle,
            port,
            armed: true,
        };
        self.shared.wake_driver();
        debug!(remote = %addr, port, "connecting");

        poll_fn(|cx| pending.poll_established(cx, addr)).await?;

        let local = SocketAddr::V6(SocketAddrV6::new(local_ip, port, 0, 0));
        debug!(remote = %addr, local = %local, "connected");
        Ok(pending.into_stream(local, addr))
    }

    /// Start listening for TCP connections on `addr`.
    ///
    /// Port 0 picks an ephemeral port. The unspecified address `[::]`
    /// accepts connections to any local destination.
    ///
    /// # Errors
    ///
    /// - `StackError::Ipv4Unsupported` for IPv4 addresses
    /// - `StackError::AddrInUse` if the port is taken
    /// - `StackError::Listen` if the stack refuses the endpoint
    pub fn listen_tcp(&self, addr: SocketAddr) -> Result<TcpListener, StackError> {
        listen_endpoint(addr, addr.port())?;
        if self.shared.is_closed() {
            return Err(StackError::Closed);
        }

        let mut guard = self.shared.core.lock();
        let core = &mut *guard;
        let port = core.ports.reserve(Proto::Tcp, addr.port()).ok_or(if addr.port() == 0 {
            StackError::PortsExhausted
        } else {
            StackError::AddrInUse(addr)
        })?;
        let endpoint = listen_endpoint(addr, port)?;

        let backlog_len = self.shared.config.listen_backlog.max(1);
        let mut backlog = Vec::with_capacity(backlog_len);
        for _ in 0..backlog_len {
            let mut socket = self.tcp_socket();
            if let Err(e) = socket.listen(endpoint) {
                for handle in backlog {
                    core.sockets.remove(handle);
                }
                core.ports.release(Proto::Tcp, port);
                return Err(StackError::Listen {
                    addr,
                    reason: e.to_string(),
                });
            }
            backlog.push(core.sockets.add(socket));
        }
        drop(guard);

        let mut local = addr;
        local.set_port(port);
        debug!(local = %local, backlog = backlog_len, "listening");
        Ok(TcpListener {
            stack: self.clone(),
            local,
            endpoint,
            backlog,
        })
    }
}
