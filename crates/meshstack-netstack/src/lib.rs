//! # meshstack netstack
//!
//! A userspace TCP/IP stack running on top of an overlay engine's raw IPv6
//! packet transport.
//!
//! The overlay hands us whole IPv6 datagrams; this crate turns them into
//! ordinary streams and datagram sockets:
//!
//! - [`LinkEndpoint`]: virtual NIC adapting the transport to a link layer,
//!   with a reader task and a side queue for outbound TCP resets
//! - [`NetStack`]: one smoltcp interface with the node's overlay address and
//!   a single `200::/7` route, driven by a background task
//! - [`TcpStream`], [`TcpListener`], [`UdpSocket`]: tokio-compatible sockets
//! - [`NetStack::dial_context`]: `host:port` dialing with cancellation
//!
//! ## Example
//!
//! ```no_run
//! use meshstack_core::{LoopbackEngine, PublicKey};
//! use meshstack_netstack::{NetStack, StackConfig};
//! use tokio::io::AsyncWriteExt;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (engine, _peer) = LoopbackEngine::pair(
//!     PublicKey::from_bytes([1; 32]),
//!     PublicKey::from_bytes([2; 32]),
//!     1500,
//! );
//! let stack = NetStack::new(&engine, StackConfig::default())?;
//!
//! let ctx = CancellationToken::new();
//! let mut conn = stack.dial_context(&ctx, "tcp", "[200::1]:9000").await?;
//! conn.write_all(b"ping").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod device;
pub mod dial;
pub mod error;
pub mod nic;
pub mod packet;
pub mod stack;
pub mod tcp;
pub mod udp;

pub use config::{NicId, StackConfig};
pub use dial::{Connection, Network, parse_endpoint};
pub use error::{LinkError, StackError};
pub use nic::{LinkEndpoint, LinkHealth, LinkStats, PacketDispatcher, RESET_QUEUE_CAPACITY};
pub use packet::{IPV6_PROTOCOL_NUMBER, PacketDecodeError, PacketView};
pub use stack::{NetStack, RouteEntry};
pub use tcp::{TcpListener, TcpStream};
pub use udp::UdpSocket;
