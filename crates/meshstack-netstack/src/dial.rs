//! String-addressed dial facade over the stack.
//!
//! Endpoints are `host:port` with a literal host; IPv6 hosts go in brackets
//! (`[200::1]:80`). Name lookup is not done here; callers resolve first.

use crate::error::StackError;
use crate::stack::NetStack;
use crate::tcp::TcpStream;
use crate::udp::UdpSocket;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Transport selected by a network name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// `tcp` or `tcp6`
    Tcp,
    /// `udp` or `udp6`
    Udp,
}

impl FromStr for Network {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" | "tcp6" => Ok(Self::Tcp),
            "udp" | "udp6" => Ok(Self::Udp),
            other => Err(StackError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// Parse a `host:port` endpoint with a literal host.
///
/// # Errors
///
/// - `StackError::InvalidEndpoint` naming the input if it is not
///   `host:port` with a literal IP host
/// - `StackError::Ipv4Unsupported` for IPv4 hosts
pub fn parse_endpoint(address: &str) -> Result<SocketAddr, StackError> {
    let addr = address.parse::<SocketAddr>().map_err(|_| StackError::InvalidEndpoint {
        input: address.to_string(),
        reason: endpoint_problem(address),
    })?;
    if addr.is_ipv4() {
        return Err(StackError::Ipv4Unsupported(addr));
    }
    Ok(addr)
}

fn endpoint_problem(address: &str) -> &'static str {
    if let Some(rest) = address.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return "missing ']' in address";
        };
        let Some(port) = tail.strip_prefix(':') else {
            return "missing port";
        };
        if port.parse::<u16>().is_err() {
            return "invalid port";
        }
        if host.parse::<IpAddr>().is_err() {
            return "host must be a literal IP address";
        }
        return "malformed endpoint";
    }

    match address.matches(':').count() {
        0 => "missing port",
        1 => {
            let (host, port) = address.split_once(':').unwrap_or((address, ""));
            if port.parse::<u16>().is_err() {
                "invalid port"
            } else if host.parse::<IpAddr>().is_err() {
                "host must be a literal IP address"
            } else {
                "malformed endpoint"
            }
        }
        _ => "IPv6 host must be enclosed in brackets",
    }
}

/// Result of a string-addressed dial
#[derive(Debug)]
pub enum Connection {
    /// Connected TCP stream
    Tcp(TcpStream),
    /// UDP socket associated with the dialed peer
    Udp(UdpSocket),
}

impl Connection {
    /// Remote endpoint
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(stream) => Some(stream.peer_addr()),
            Self::Udp(socket) => socket.peer_addr(),
        }
    }

    /// Local endpoint
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Self::Tcp(stream) => stream.local_addr(),
            Self::Udp(socket) => socket.local_addr(),
        }
    }

    /// The TCP stream, if this is one
    #[must_use]
    pub fn into_tcp(self) -> Option<TcpStream> {
        match self {
            Self::Tcp(stream) => Some(stream),
            Self::Udp(_) => None,
        }
    }

    /// The UDP socket, if this is one
    #[must_use]
    pub fn into_udp(self) -> Option<UdpSocket> {
        match self {
            Self::Udp(socket) => Some(socket),
            Self::Tcp(_) => None,
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Udp(socket) => Pin::new(socket).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, data),
            Self::Udp(socket) => Pin::new(socket).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Udp(socket) => Pin::new(socket).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Udp(socket) => Pin::new(socket).poll_shutdown(cx),
        }
    }
}

impl NetStack {
    /// Dial `address` over `network` until connected or `ctx` is cancelled.
    ///
    /// Cancellation aborts an in-flight TCP handshake (the peer sees a reset)
    /// and releases the local port.
    ///
    /// # Errors
    ///
    /// - `StackError::UnsupportedNetwork` for networks other than
    ///   tcp/tcp6/udp/udp6
    /// - `StackError::InvalidEndpoint` / `Ipv4Unsupported` for bad addresses
    /// - `StackError::NoRoute` for destinations outside `200::/7`
    /// - `StackError::Cancelled` if `ctx` fires first
    /// - any error from [`dial_tcp`](Self::dial_tcp) or
    ///   [`dial_udp`](Self::dial_udp)
    pub async fn dial_context(
        &self,
        ctx: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<Connection, StackError> {
        let network: Network = network.parse()?;
        let addr = parse_endpoint(address)?;

        tokio::select! {
            biased;
            () = ctx.cancelled() => {
                debug!(remote = %addr, ?network, "dial cancelled");
                Err(StackError::Cancelled)
            }
            result = self.dial(network, addr) => result,
        }
    }

    /// Dial a pre-resolved endpoint
    ///
    /// # Errors
    ///
    /// See [`dial_tcp`](Self::dial_tcp) and [`dial_udp`](Self::dial_udp).
    pub async fn dial(&self, network: Network, addr: SocketAddr) -> Result<Connection, StackError> {
        match network {
            Network::Tcp => self.dial_tcp(addr).await.map(Connection::Tcp),
            Network::Udp => self.dial_udp(addr).map(Connection::Udp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use meshstack_core::{LoopbackEngine, PublicKey};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_network_names() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("tcp6".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("udp".parse::<Network>().unwrap(), Network::Udp);
        assert_eq!("udp6".parse::<Network>().unwrap(), Network::Udp);
        assert!(matches!(
            "sctp".parse::<Network>(),
            Err(StackError::UnsupportedNetwork(name)) if name == "sctp"
        ));
    }

    #[test]
    fn test_parse_endpoint() {
        let addr = parse_endpoint("[200::1]:80").unwrap();
        assert_eq!(addr.port(), 80);

        assert!(matches!(parse_endpoint("1.2.3.4:80"), Err(StackError::Ipv4Unsupported(_))));

        let cases = [
            ("example.com", "missing port"),
            ("[200::1]", "missing port"),
            ("[200::1]:http", "invalid port"),
            ("example.com:80", "host must be a literal IP address"),
            ("[example.com]:80", "host must be a literal IP address"),
            ("200::1:80", "IPv6 host must be enclosed in brackets"),
        ];
        for (input, expected) in cases {
            match parse_endpoint(input) {
                Err(StackError::InvalidEndpoint { input: got, reason }) => {
                    assert_eq!(got, input);
                    assert_eq!(reason, expected, "input {input}");
                }
                other => panic!("{input}: unexpected {other:?}"),
            }
        }
    }

    fn stacks() -> (NetStack, NetStack, LoopbackEngine, LoopbackEngine) {
        let (a, b) = LoopbackEngine::pair(
            PublicKey::from_bytes([0x51; 32]),
            PublicKey::from_bytes([0x52; 32]),
            1500,
        );
        let stack_a = NetStack::new(&a, StackConfig::default()).unwrap();
        let stack_b = NetStack::new(&b, StackConfig::default()).unwrap();
        (stack_a, stack_b, a, b)
    }

    #[tokio::test]
    async fn test_dial_context_tcp() {
        let (a, b, _ea, _eb) = stacks();
        let mut listener = a.listen_tcp("[::]:9100".parse().unwrap()).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let ctx = CancellationToken::new();
        let address = format!("[{}]:9100", a.local_addr());
        let mut conn = b.dial_context(&ctx, "tcp6", &address).await.unwrap();
        conn.write_all(b"hello overlay").await.unwrap();
        conn.shutdown().await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"hello overlay");
    }

    #[tokio::test]
    async fn test_dial_context_udp() {
        let (a, b, _ea, _eb) = stacks();
        let server = a.listen_udp("[::]:5400".parse().unwrap()).unwrap();

        let ctx = CancellationToken::new();
        let mut conn = b
            .dial_context(&ctx, "udp", &format!("[{}]:5400", a.local_addr()))
            .await
            .unwrap();
        conn.write_all(b"dgram").await.unwrap();

        let mut buf = [0u8; 32];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"dgram");
    }

    #[tokio::test]
    async fn test_dial_context_cancelled() {
        let (_a, b, _ea, _eb) = stacks();
        let ctx = CancellationToken::new();
        ctx.cancel();

        // Unreachable overlay address, so only cancellation can end the dial
        let err = b
            .dial_context(&ctx, "tcp", "[2ff::1]:80")
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_dial_releases_socket_and_port() {
        let (a, b, ea, _eb) = stacks();
        // A stops reading, so the handshake stays in SYN-SENT
        ea.loopback().shutdown();
        let baseline = b.open_resources();

        let ctx = CancellationToken::new();
        let canceller = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ctx.cancel();
            })
        };
        let address = format!("[{}]:9200", a.local_addr());
        let dial = b.dial_context(&ctx, "tcp", &address);
        let err = tokio::time::timeout(Duration::from_secs(5), dial)
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StackError::Cancelled));
        canceller.await.unwrap();

        for _ in 0..200 {
            if b.open_resources() == baseline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("aborted dial still holds {:?}", b.open_resources());
    }

    #[tokio::test]
    async fn test_dial_context_rejects_bad_input() {
        let (_a, b, _ea, _eb) = stacks();
        let ctx = CancellationToken::new();
        assert!(matches!(
            b.dial_context(&ctx, "ip", "[200::1]:80").await,
            Err(StackError::UnsupportedNetwork(_))
        ));
        assert!(matches!(
            b.dial_context(&ctx, "tcp", "10.0.0.1:80").await,
            Err(StackError::Ipv4Unsupported(_))
        ));
        assert!(matches!(
            b.dial_context(&ctx, "udp", "[2001:db8::1]:53").await,
            Err(StackError::NoRoute(_))
        ));
    }
}
