//! Read-only session and path snapshots.
//!
//! Both projections pull the engine's tables fresh on every call and never
//! write back. Peer addresses come from the same derivation the resolver
//! uses for `.pk.ygg` names.

use crate::address::{PublicKey, address_for_key};
use crate::engine::OverlayEngine;
use serde::Serialize;
use std::net::Ipv6Addr;
use std::time::Duration;
use thiserror::Error;

/// Introspection errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntrospectError {
    /// The overlay engine is not active
    #[error("overlay engine is not running")]
    NotRunning,
}

/// Snapshot of one live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    /// Peer overlay address
    pub address: Ipv6Addr,
    /// Peer public key
    pub public_key: PublicKey,
    /// Bytes received from the peer
    pub rx_bytes: u64,
    /// Bytes sent to the peer
    pub tx_bytes: u64,
    /// Session age
    pub uptime: Duration,
}

/// Snapshot of one known path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathRecord {
    /// Destination overlay address
    pub address: Ipv6Addr,
    /// Destination public key
    pub public_key: PublicKey,
    /// Path coordinates, source side first
    pub path: Vec<u64>,
}

/// Project the engine's session table.
///
/// # Errors
///
/// Returns `IntrospectError::NotRunning` if the engine is inactive.
pub fn sessions(engine: &dyn OverlayEngine) -> Result<Vec<SessionRecord>, IntrospectError> {
    if !engine.is_running() {
        return Err(IntrospectError::NotRunning);
    }

    Ok(engine
        .session_table()
        .into_iter()
        .map(|entry| SessionRecord {
            address: address_for_key(&entry.key).ip(),
            public_key: entry.key,
            rx_bytes: entry.rx_bytes,
            tx_bytes: entry.tx_bytes,
            uptime: entry.uptime,
        })
        .collect())
}

/// Project the engine's path table.
///
/// # Errors
///
/// Returns `IntrospectError::NotRunning` if the engine is inactive.
pub fn paths(engine: &dyn OverlayEngine) -> Result<Vec<PathRecord>, IntrospectError> {
    if !engine.is_running() {
        return Err(IntrospectError::NotRunning);
    }

    Ok(engine
        .path_table()
        .into_iter()
        .map(|entry| PathRecord {
            address: address_for_key(&entry.key).ip(),
            public_key: entry.key,
            path: entry.path,
        })
        .collect())
}
