//! Handle to a running overlay engine.
//!
//! The engine itself (peering, routing, encryption) lives outside this
//! workspace. Everything meshstack needs from it is captured by
//! [`OverlayEngine`]: the node's key, a liveness flag, the raw packet
//! transport, and the live peer and path tables.

use crate::address::{Address, PublicKey, Subnet, address_for_key, subnet_for_key};
use crate::transport::OverlayTransport;
use std::sync::Arc;
use std::time::Duration;

/// One row of the engine's live session table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    /// Remote public key
    pub key: PublicKey,
    /// Bytes received from the peer
    pub rx_bytes: u64,
    /// Bytes sent to the peer
    pub tx_bytes: u64,
    /// Time since the session was established
    pub uptime: Duration,
}

/// One row of the engine's path table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    /// Destination public key
    pub key: PublicKey,
    /// Ordered path coordinates toward the destination
    pub path: Vec<u64>,
}

/// A live overlay engine
pub trait OverlayEngine: Send + Sync {
    /// The node's own public key
    fn public_key(&self) -> PublicKey;

    /// Whether the engine is currently up
    fn is_running(&self) -> bool;

    /// Raw packet transport into the overlay
    fn transport(&self) -> Arc<dyn OverlayTransport>;

    /// Copy of the current session table
    fn session_table(&self) -> Vec<SessionEntry>;

    /// Copy of the current path table
    fn path_table(&self) -> Vec<PathEntry>;

    /// The node's own overlay address
    fn address(&self) -> Address {
        address_for_key(&self.public_key())
    }

    /// The node's routed subnet
    fn subnet(&self) -> Subnet {
        subnet_for_key(&self.public_key())
    }
}
