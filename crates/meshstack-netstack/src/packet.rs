//! Outbound packet views and the checks the NIC runs on them.
//!
//! The stack emits each datagram as a [`PacketView`]. Before a view reaches
//! the overlay it is flattened into the NIC's write buffer by
//! [`PacketView::write_to`], which validates the IPv6 framing and fails with
//! a typed [`PacketDecodeError`] instead of touching bytes that are not there.

use bytes::Bytes;
use smoltcp::wire::{Icmpv6Message, Icmpv6Packet, IpProtocol, Ipv6Packet, TcpPacket};
use std::net::Ipv6Addr;
use thiserror::Error;

/// EtherType-style protocol number the NIC delivers inbound packets under
pub const IPV6_PROTOCOL_NUMBER: u16 = 0x86DD;

/// Fixed IPv6 header size
pub const IPV6_HEADER_LEN: usize = 40;

/// Minimum link MTU for IPv6
pub const IPV6_MIN_MTU: usize = 1280;

/// Malformed outbound packet
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PacketDecodeError {
    /// Shorter than an IPv6 header
    #[error("packet of {0} bytes is shorter than an IPv6 header")]
    Truncated(usize),

    /// Version nibble is not 6
    #[error("unsupported IP version {0}")]
    NotIpv6(u8),

    /// Header claims more payload than the buffer holds
    #[error("IPv6 payload length {declared} exceeds the {available} bytes available")]
    LengthMismatch {
        /// Payload length from the header
        declared: usize,
        /// Payload bytes present
        available: usize,
    },
}

/// One outbound IPv6 datagram as produced by the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketView {
    data: Bytes,
}

impl PacketView {
    /// Wrap an emitted datagram
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Raw bytes as emitted
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Cheap owned handle to the bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Emitted length
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the view holds no bytes at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether this is a TCP segment with the RST flag and no payload
    #[must_use]
    pub fn is_bare_reset(&self) -> bool {
        let Ok(ip) = Ipv6Packet::new_checked(self.data.as_ref()) else {
            return false;
        };
        if ip.version() != 6 || ip.next_header() != IpProtocol::Tcp {
            return false;
        }
        let Ok(tcp) = TcpPacket::new_checked(ip.payload()) else {
            return false;
        };
        tcp.rst() && tcp.payload().is_empty()
    }

    /// Flatten the datagram into `out`, replacing its contents.
    ///
    /// Exactly the header plus the declared payload is copied; trailing
    /// bytes past the declared length are not.
    ///
    /// # Errors
    ///
    /// Returns `PacketDecodeError` if the IPv6 framing is inconsistent.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<usize, PacketDecodeError> {
        let data = self.data.as_ref();
        if data.len() < IPV6_HEADER_LEN {
            return Err(PacketDecodeError::Truncated(data.len()));
        }

        let version = data[0] >> 4;
        if version != 6 {
            return Err(PacketDecodeError::NotIpv6(version));
        }

        let declared = usize::from(u16::from_be_bytes([data[4], data[5]]));
        let available = data.len() - IPV6_HEADER_LEN;
        if declared > available {
            return Err(PacketDecodeError::LengthMismatch {
                declared,
                available,
            });
        }

        let total = IPV6_HEADER_LEN + declared;
        out.clear();
        out.extend_from_slice(&data[..total]);
        Ok(total)
    }
}

/// Whether `packet` is an ICMPv6 echo request addressed to `local`
#[must_use]
pub fn is_echo_request_to(packet: &[u8], local: Ipv6Addr) -> bool {
    let Ok(ip) = Ipv6Packet::new_checked(packet) else {
        return false;
    };
    if ip.next_header() != IpProtocol::Icmpv6 || Ipv6Addr::from(ip.dst_addr()) != local {
        return false;
    }
    Icmpv6Packet::new_checked(ip.payload())
        .map(|icmp| icmp.msg_type() == Icmpv6Message::EchoRequest)
        .unwrap_or(false)
}

/// Hand-built datagrams for tests across the crate
#[cfg(test)]
pub(crate) mod testing {
    use super::IPV6_HEADER_LEN;

    /// TCP flag bits
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;

    fn ipv6_header(next_header: u8, payload_len: usize, dst_last: u8) -> Vec<u8> {
        let mut header = vec![0u8; IPV6_HEADER_LEN];
        header[0] = 0x60;
        header[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
        header[6] = next_header;
        header[7] = 64;
        header[8] = 0x02;
        header[23] = 0x01;
        header[24] = 0x02;
        header[39] = dst_last;
        header
    }

    /// IPv6 + 20-byte TCP header with the given flags and payload
    pub fn tcp_packet(flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&40000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&9000u16.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = flags;
        tcp[14..16].copy_from_slice(&1024u16.to_be_bytes());
        tcp.extend_from_slice(payload);

        let mut packet = ipv6_header(6, tcp.len(), 0x02);
        packet.extend_from_slice(&tcp);
        packet
    }

    /// IPv6 + ICMPv6 echo request to `200::<dst_last>`
    pub fn echo_request(dst_last: u8) -> Vec<u8> {
        let icmp = vec![128u8, 0, 0, 0, 0, 1, 0, 1];
        let mut packet = ipv6_header(58, icmp.len(), dst_last);
        packet.extend_from_slice(&icmp);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bare_reset_detection() {
        assert!(PacketView::new(tcp_packet(RST, &[])).is_bare_reset());
        assert!(PacketView::new(tcp_packet(RST | ACK, &[])).is_bare_reset());
        assert!(!PacketView::new(tcp_packet(RST, b"data")).is_bare_reset());
        assert!(!PacketView::new(tcp_packet(SYN, &[])).is_bare_reset());
        assert!(!PacketView::new(tcp_packet(ACK | FIN, &[])).is_bare_reset());
        assert!(!PacketView::new(echo_request(1)).is_bare_reset());
        assert!(!PacketView::new(vec![0u8; 10]).is_bare_reset());
    }

    #[test]
    fn test_write_to_copies_declared_length() {
        let mut packet = tcp_packet(ACK, b"ping");
        let expected = packet.len();
        packet.extend_from_slice(&[0xEE; 8]);

        let mut out = vec![0xAA; 3];
        let n = PacketView::new(packet.clone()).write_to(&mut out).unwrap();
        assert_eq!(n, expected);
        assert_eq!(out, packet[..expected]);
    }

    #[test]
    fn test_write_to_rejects_malformed() {
        let mut out = Vec::new();
        assert_eq!(
            PacketView::new(vec![0x60; 12]).write_to(&mut out),
            Err(PacketDecodeError::Truncated(12))
        );

        let mut v4 = tcp_packet(ACK, &[]);
        v4[0] = 0x45;
        assert_eq!(
            PacketView::new(v4).write_to(&mut out),
            Err(PacketDecodeError::NotIpv6(4))
        );

        let mut short = tcp_packet(ACK, b"abcdef");
        short.truncate(IPV6_HEADER_LEN + 10);
        assert_eq!(
            PacketView::new(short).write_to(&mut out),
            Err(PacketDecodeError::LengthMismatch {
                declared: 26,
                available: 10
            })
        );
    }

    #[test]
    fn test_echo_request_match() {
        let local: Ipv6Addr = "200::1:2".parse().unwrap();
        let mut to_local = echo_request(0);
        to_local[24..40].copy_from_slice(&local.octets());
        assert!(is_echo_request_to(&to_local, local));
        assert!(!is_echo_request_to(&echo_request(9), local));
        assert!(!is_echo_request_to(&tcp_packet(SYN, &[]), local));
    }

    proptest! {
        #[test]
        fn prop_classification_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..200)) {
            let view = PacketView::new(bytes.clone());
            let _ = view.is_bare_reset();
            let mut out = Vec::new();
            if let Ok(n) = view.write_to(&mut out) {
                prop_assert_eq!(out.len(), n);
                prop_assert!(n <= bytes.len());
            }
            let _ = is_echo_request_to(&bytes, Ipv6Addr::LOCALHOST);
        }
    }
}
