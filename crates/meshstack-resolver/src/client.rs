//! DNS lookups carried over the overlay itself.
//!
//! The query goes out as a UDP datagram dialed through the stack; if the
//! answer comes back with TC set, the same query is repeated once over a TCP
//! connection with the two-byte length prefix. There are no internal
//! timeouts: the caller's token bounds the exchange.

use crate::dns::{
    DNS_PORT, DnsMessage, MAX_UDP_MESSAGE, RCODE_NOERROR, RCODE_NXDOMAIN, RCODE_SERVFAIL,
    RecordType,
};
use crate::error::{DnsError, ResolveError};
use async_trait::async_trait;
use meshstack_netstack::{Connection, NetStack};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// One address lookup against a nameserver
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// Look up `rtype` records for `name`, returning addresses in answer order.
    ///
    /// An empty answer is an error (`DnsError::NoAnswer`), never an empty
    /// vector.
    async fn lookup(
        &self,
        ctx: &CancellationToken,
        name: &str,
        rtype: RecordType,
    ) -> Result<Vec<IpAddr>, DnsError>;
}

/// Configured nameserver endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nameserver(SocketAddr);

impl Nameserver {
    /// Parse `host` or `host:port` with a literal IPv6 host; the port
    /// defaults to 53.
    ///
    /// Bare IPv6 hosts are accepted without brackets when no port is given.
    /// IPv4 hosts are refused since the overlay cannot reach them.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::InvalidNameserver` naming the input.
    pub fn parse(input: &str) -> Result<Self, ResolveError> {
        let trimmed = input.trim();
        let bracketed = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'));
        let addr = trimmed
            .parse::<IpAddr>()
            .ok()
            .or_else(|| bracketed.and_then(|host| host.parse::<IpAddr>().ok()))
            .map(|ip| SocketAddr::new(ip, DNS_PORT))
            .or_else(|| trimmed.parse::<SocketAddr>().ok())
            .ok_or_else(|| ResolveError::InvalidNameserver {
                input: input.to_string(),
                reason: "expected a literal IP address with an optional port",
            })?;

        if addr.is_ipv4() {
            return Err(ResolveError::InvalidNameserver {
                input: input.to_string(),
                reason: "IPv4 nameservers are not reachable over the overlay",
            });
        }
        Ok(Self(addr))
    }

    /// Endpoint the queries are sent to
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for Nameserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// DNS client that reaches its nameserver through a [`NetStack`]
#[derive(Debug, Clone)]
pub struct OverlayDns {
    stack: NetStack,
    nameserver: Nameserver,
    endpoint: String,
}

impl OverlayDns {
    /// Client for `nameserver` over `stack`
    #[must_use]
    pub fn new(stack: NetStack, nameserver: Nameserver) -> Self {
        Self {
            stack,
            endpoint: nameserver.to_string(),
            nameserver,
        }
    }

    /// The configured nameserver
    #[must_use]
    pub fn nameserver(&self) -> Nameserver {
        self.nameserver
    }

    async fn exchange_udp(
        &self,
        ctx: &CancellationToken,
        query: &DnsMessage,
        packet: &[u8],
    ) -> Result<DnsMessage, DnsError> {
        let conn = self.stack.dial_context(ctx, "udp", &self.endpoint).await?;
        cancellable(ctx, udp_round_trip(conn, query.id, packet)).await
    }

    async fn exchange_tcp(
        &self,
        ctx: &CancellationToken,
        packet: &[u8],
    ) -> Result<DnsMessage, DnsError> {
        let conn = self.stack.dial_context(ctx, "tcp", &self.endpoint).await?;
        cancellable(ctx, tcp_round_trip(conn, packet)).await
    }
}

async fn udp_round_trip(
    mut conn: Connection,
    id: u16,
    packet: &[u8],
) -> Result<DnsMessage, DnsError> {
    conn.write_all(packet).await?;
    let mut buf = vec![0u8; MAX_UDP_MESSAGE];
    loop {
        let n = conn.read(&mut buf).await?;
        match DnsMessage::decode(&buf[..n]) {
            Ok(response) if response.id == id => return Ok(response),
            Ok(stale) => trace!(id = stale.id, "ignoring response with foreign id"),
            Err(e) => trace!(error = %e, "ignoring undecodable datagram"),
        }
    }
}

async fn tcp_round_trip(mut conn: Connection, packet: &[u8]) -> Result<DnsMessage, DnsError> {
    let mut framed = Vec::with_capacity(packet.len() + 2);
    framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    framed.extend_from_slice(packet);
    conn.write_all(&framed).await?;

    let mut len = [0u8; 2];
    conn.read_exact(&mut len).await?;
    let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len))];
    conn.read_exact(&mut buf).await?;
    DnsMessage::decode(&buf)
}

#[async_trait]
impl DnsLookup for OverlayDns {
    async fn lookup(
        &self,
        ctx: &CancellationToken,
        name: &str,
        rtype: RecordType,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let query = DnsMessage::query(name, rtype);
        let packet = query.encode()?;
        debug!(name, %rtype, nameserver = %self.nameserver, id = query.id, "DNS query");

        let mut response = self.exchange_udp(ctx, &query, &packet).await?;
        if response.is_truncated() {
            debug!(name, %rtype, "truncated UDP answer, retrying over TCP");
            response = self.exchange_tcp(ctx, &packet).await?;
        }

        answer_addresses(&query, &response, rtype)
    }
}

/// Validate `response` against `query` and extract the addresses
pub(crate) fn answer_addresses(
    query: &DnsMessage,
    response: &DnsMessage,
    rtype: RecordType,
) -> Result<Vec<IpAddr>, DnsError> {
    if !response.is_response() {
        return Err(DnsError::NotAResponse);
    }
    if response.id != query.id {
        return Err(DnsError::IdMismatch {
            expected: query.id,
            got: response.id,
        });
    }
    if let (Some(asked), Some(answered)) = (query.questions.first(), response.questions.first()) {
        if !asked.matches(answered) {
            return Err(DnsError::QuestionMismatch);
        }
    }

    match response.rcode() {
        RCODE_NOERROR => {}
        RCODE_NXDOMAIN => return Err(DnsError::NxDomain),
        RCODE_SERVFAIL => return Err(DnsError::ServFail),
        other => return Err(DnsError::Rcode(other)),
    }

    let addresses = response.addresses(rtype);
    if addresses.is_empty() {
        return Err(DnsError::NoAnswer);
    }
    Ok(addresses)
}

async fn cancellable<T>(
    ctx: &CancellationToken,
    exchange: impl Future<Output = Result<T, DnsError>>,
) -> Result<T, DnsError> {
    tokio::select! {
        biased;
        () = ctx.cancelled() => Err(DnsError::Cancelled),
        result = exchange => result,
    }
}
