//! # meshstack core
//!
//! Shared primitives for the meshstack workspace:
//! - Public-key-derived overlay addressing (`200::/7`)
//! - The overlay engine and raw packet transport contract
//! - Read-only session and path introspection
//! - An in-memory loopback overlay for tests and self-checks

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod engine;
pub mod introspect;
pub mod loopback;
pub mod transport;

pub use address::{
    ADDRESS_PREFIX, Address, AddressError, OVERLAY_PREFIX_LEN, PUBLIC_KEY_LEN, PublicKey, Subnet,
    address_for_key, is_overlay_ip, overlay_network, subnet_for_key,
};
pub use engine::{OverlayEngine, PathEntry, SessionEntry};
pub use introspect::{IntrospectError, PathRecord, SessionRecord, paths, sessions};
pub use loopback::{LoopbackEngine, LoopbackTransport};
pub use transport::{
    AtomicTransportStats, OverlayTransport, TransportError, TransportResult, TransportStats,
};
