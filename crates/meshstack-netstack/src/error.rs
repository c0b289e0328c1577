//! Error types for the netstack
//!
//! Errors fall into three groups:
//!
//! - **Construction**: the stack could not be built; nothing was left running.
//! - **Addressing**: a caller-supplied endpoint was unusable; always returned
//!   synchronously and naming the offending input.
//! - **Link**: the overlay transport failed under the NIC. These are never
//!   retried here; the owner decides whether to rebuild the stack.

use meshstack_core::TransportError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by the virtual NIC's write path
#[derive(Debug, Error)]
pub enum LinkError {
    /// The transport rejected a packet; earlier packets in the batch went out
    #[error("overlay write failed after {written} packets: {source}")]
    Write {
        /// Packets handled before the failure
        written: usize,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// The NIC has been closed
    #[error("link endpoint is closed")]
    Closed,
}

impl LinkError {
    /// Packets handled before the error
    #[must_use]
    pub fn written(&self) -> usize {
        match self {
            Self::Write { written, .. } => *written,
            Self::Closed => 0,
        }
    }
}

/// Errors raised by the stack and its dial/listen facade
#[derive(Debug, Error)]
pub enum StackError {
    // ============ Construction Errors ============
    /// Stack construction needs a Tokio runtime
    #[error("no Tokio runtime available to run the stack tasks")]
    NoRuntime,

    /// Overlay MTU below the IPv6 minimum
    #[error("overlay MTU {mtu} is below the IPv6 minimum of {min}")]
    MtuTooSmall {
        /// Transport MTU
        mtu: usize,
        /// Required minimum
        min: usize,
    },

    /// The interface refused the local protocol address
    #[error("interface address table is full")]
    AddressTableFull,

    /// The interface refused the overlay route
    #[error("interface route table is full")]
    RouteTableFull,

    // ============ Addressing Errors ============
    /// Network name other than tcp/tcp6/udp/udp6
    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),

    /// Endpoint string could not be parsed
    #[error("invalid endpoint {input:?}: {reason}")]
    InvalidEndpoint {
        /// Offending input
        input: String,
        /// What was wrong with it
        reason: &'static str,
    },

    /// IPv4 endpoints have no overlay route
    #[error("IPv4 endpoint {0} is not reachable over the overlay")]
    Ipv4Unsupported(SocketAddr),

    /// Destination outside the overlay's `200::/7` route
    #[error("no route to {0}: destination is outside the overlay network")]
    NoRoute(SocketAddr),

    /// Local port already bound
    #[error("address {0} already in use")]
    AddrInUse(SocketAddr),

    /// No ephemeral port left
    #[error("no ephemeral ports available")]
    PortsExhausted,

    // ============ Connection Errors ============
    /// The stack refused to start a connection
    #[error("connect to {addr} failed: {reason}")]
    Connect {
        /// Remote endpoint
        addr: SocketAddr,
        /// Stack-level reason
        reason: String,
    },

    /// The remote end reset the connection attempt
    #[error("connection to {0} refused")]
    ConnectionRefused(SocketAddr),

    /// Listening socket could not be set up
    #[error("listen on {addr} failed: {reason}")]
    Listen {
        /// Local endpoint
        addr: SocketAddr,
        /// Stack-level reason
        reason: String,
    },

    /// UDP socket could not be bound
    #[error("bind to {addr} failed: {reason}")]
    Bind {
        /// Local endpoint
        addr: SocketAddr,
        /// Stack-level reason
        reason: String,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// The stack has been shut down
    #[error("stack is closed")]
    Closed,

    /// Link-layer failure
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl From<StackError> for io::Error {
    fn from(err: StackError) -> Self {
        let kind = match &err {
            StackError::UnsupportedNetwork(_)
            | StackError::InvalidEndpoint { .. }
            | StackError::Ipv4Unsupported(_) => io::ErrorKind::InvalidInput,
            StackError::NoRoute(_) => io::ErrorKind::HostUnreachable,
            StackError::AddrInUse(_) => io::ErrorKind::AddrInUse,
            StackError::ConnectionRefused(_) => io::ErrorKind::ConnectionRefused,
            StackError::Cancelled => io::ErrorKind::Interrupted,
            StackError::Closed | StackError::Link(_) => io::ErrorKind::NotConnected,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
