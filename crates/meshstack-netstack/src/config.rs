//! Stack configuration.

use std::fmt;

/// Identifier of the stack's single virtual NIC.
///
/// Independent stacks in one process each carry their own id, which shows up
/// in every log line the NIC emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NicId(pub u32);

impl Default for NicId {
    fn default() -> Self {
        Self(1)
    }
}

impl fmt::Display for NicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nic{}", self.0)
    }
}

/// Netstack configuration
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Identifier of the virtual NIC
    pub nic_id: NicId,
    /// Answer traffic for the node's own address locally (ICMPv6 echo).
    /// When off, the stack runs in forwarding mode across the overlay range.
    pub handle_local: bool,
    /// Per-connection TCP receive buffer in bytes
    pub tcp_rx_buffer: usize,
    /// Per-connection TCP send buffer in bytes
    pub tcp_tx_buffer: usize,
    /// Per-socket UDP payload storage in bytes (each direction)
    pub udp_buffer: usize,
    /// Per-socket UDP datagram slots (each direction)
    pub udp_packets: usize,
    /// Listening sockets kept armed per TCP listener
    pub listen_backlog: usize,
    /// Inbound packets buffered between the reader task and the stack
    pub inbound_queue: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            nic_id: NicId::default(),
            handle_local: true,
            tcp_rx_buffer: 64 * 1024,
            tcp_tx_buffer: 64 * 1024,
            udp_buffer: 64 * 1024,
            udp_packets: 32,
            listen_backlog: 8,
            inbound_queue: 1024,
        }
    }
}

impl StackConfig {
    /// Default configuration for a given NIC id
    #[must_use]
    pub fn with_nic(nic_id: NicId) -> Self {
        Self {
            nic_id,
            ..Self::default()
        }
    }
}
