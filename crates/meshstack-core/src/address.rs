//! Public-key-derived overlay addressing.
//!
//! Every node on the overlay owns an IPv6 address computed from its 32-byte
//! public key, and a routed `/64` subnet computed the same way. The
//! derivation is one-way in general, but enough of the key survives in the
//! address to recover a partial key for peer lookups.
//!
//! ```text
//!  byte 0    byte 1           bytes 2..16
//! +-------+--------------+---------------------------------+
//! | 0x02  | leading ones | key bits after the first zero   |
//! +-------+--------------+---------------------------------+
//! ```
//!
//! The key is bit-inverted before encoding, so "leading ones" counts the
//! leading zero bits of the original key.

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use thiserror::Error;

/// Public key length in bytes
pub const PUBLIC_KEY_LEN: usize = 32;

/// First byte of every node address
pub const ADDRESS_PREFIX: u8 = 0x02;

/// Prefix length of the overlay range (`200::/7`)
pub const OVERLAY_PREFIX_LEN: u8 = 7;

/// Number of packed key bytes carried by an address
const ADDRESS_KEY_BYTES: usize = 14;

/// Number of packed key bytes carried by a subnet
const SUBNET_KEY_BYTES: usize = 6;

/// Addressing errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    /// Input is not valid hex
    #[error("invalid public key hex {input:?}: {reason}")]
    InvalidHex {
        /// Offending input
        input: String,
        /// Decoder message
        reason: String,
    },

    /// Decoded key has the wrong length
    #[error("invalid public key length {len} for {input:?} (expected {PUBLIC_KEY_LEN} bytes)")]
    InvalidKeyLength {
        /// Offending input
        input: String,
        /// Decoded length in bytes
        len: usize,
    },
}

/// A 32-byte overlay public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Wrap raw key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, rejecting anything but 32 bytes
    ///
    /// # Errors
    ///
    /// Returns `AddressError::InvalidKeyLength` naming the hex form of the input.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        let key: [u8; PUBLIC_KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| AddressError::InvalidKeyLength {
                    input: hex::encode(bytes),
                    len: bytes.len(),
                })?;
        Ok(Self(key))
    }

    /// Decode a key from 64 hex characters
    ///
    /// # Errors
    ///
    /// Returns `AddressError::InvalidHex` for non-hex input and
    /// `AddressError::InvalidKeyLength` when the decoded length is not 32.
    pub fn from_hex(input: &str) -> Result<Self, AddressError> {
        let bytes = hex::decode(input).map_err(|e| AddressError::InvalidHex {
            input: input.to_string(),
            reason: e.to_string(),
        })?;
        let key: [u8; PUBLIC_KEY_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| AddressError::InvalidKeyLength {
                    input: input.to_string(),
                    len: bytes.len(),
                })?;
        Ok(Self(key))
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Lowercase hex encoding
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// A node address inside `200::/7`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 16]);

impl Address {
    /// Wrap raw address bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether the address carries the node prefix
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0[0] == ADDRESS_PREFIX
    }

    /// Recover the key bits encoded in this address.
    ///
    /// Bits the address does not carry come back as ones.
    #[must_use]
    pub fn partial_key(&self) -> PublicKey {
        partial_key(&self.0)
    }

    /// The address as a standard IPv6 address
    #[must_use]
    pub fn ip(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.0)
    }
}

impl From<Address> for Ipv6Addr {
    fn from(addr: Address) -> Self {
        addr.ip()
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Self(ip.octets())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.ip())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.ip(), f)
    }
}

/// A node's routed `/64` inside `300::/8`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet([u8; 8]);

impl Subnet {
    /// Raw prefix bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Whether the subnet carries the routed-prefix marker
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0[0] == ADDRESS_PREFIX | 0x01
    }

    /// Recover the key bits encoded in this subnet
    #[must_use]
    pub fn partial_key(&self) -> PublicKey {
        partial_key(&self.0)
    }

    /// Network address of the subnet
    #[must_use]
    pub fn network(&self) -> Ipv6Addr {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.0);
        Ipv6Addr::from(bytes)
    }
}

impl fmt::Debug for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subnet({self})")
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/64", self.network())
    }
}

/// The overlay range every node address falls in: `200::/7`
#[must_use]
pub fn overlay_network() -> (Ipv6Addr, u8) {
    (
        Ipv6Addr::new(u16::from(ADDRESS_PREFIX) << 8, 0, 0, 0, 0, 0, 0, 0),
        OVERLAY_PREFIX_LEN,
    )
}

/// Whether `ip` falls inside `200::/7`
#[must_use]
pub fn is_overlay_ip(ip: &Ipv6Addr) -> bool {
    ip.octets()[0] & 0xFE == ADDRESS_PREFIX
}

/// Derive the node address for a public key
#[must_use]
pub fn address_for_key(key: &PublicKey) -> Address {
    let (ones, packed) = pack_key_bits(key);
    let mut addr = [0u8; 16];
    addr[0] = ADDRESS_PREFIX;
    addr[1] = ones;
    let n = packed.len().min(ADDRESS_KEY_BYTES);
    addr[2..2 + n].copy_from_slice(&packed[..n]);
    Address(addr)
}

/// Derive the routed `/64` for a public key
#[must_use]
pub fn subnet_for_key(key: &PublicKey) -> Subnet {
    let (ones, packed) = pack_key_bits(key);
    let mut snet = [0u8; 8];
    snet[0] = ADDRESS_PREFIX | 0x01;
    snet[1] = ones;
    let n = packed.len().min(SUBNET_KEY_BYTES);
    snet[2..2 + n].copy_from_slice(&packed[..n]);
    Subnet(snet)
}

/// Invert the key, count its leading ones (8-bit, wrapping), drop the first
/// zero bit and pack everything after it into whole bytes.
fn pack_key_bits(key: &PublicKey) -> (u8, Vec<u8>) {
    let inverted = key.0.map(|b| !b);
    let mut ones = 0u8;
    let mut counting = true;
    let mut acc = 0u8;
    let mut n_bits = 0;
    let mut packed = Vec::with_capacity(PUBLIC_KEY_LEN);

    for idx in 0..8 * PUBLIC_KEY_LEN {
        let bit = (inverted[idx / 8] >> (7 - idx % 8)) & 1;
        if counting {
            if bit != 0 {
                ones = ones.wrapping_add(1);
            } else {
                counting = false;
            }
            continue;
        }
        acc = (acc << 1) | bit;
        n_bits += 1;
        if n_bits == 8 {
            packed.push(acc);
            acc = 0;
            n_bits = 0;
        }
    }

    (ones, packed)
}

fn partial_key(encoded: &[u8]) -> PublicKey {
    let mut key = [0u8; PUBLIC_KEY_LEN];
    let ones = usize::from(encoded[1]);
    for idx in 0..ones {
        key[idx / 8] |= 0x80 >> (idx % 8);
    }

    let key_offset = ones + 1;
    let encoded_offset = 16;
    for idx in encoded_offset..8 * encoded.len() {
        let mut bits = encoded[idx / 8] & (0x80 >> (idx % 8));
        bits <<= idx % 8;
        let key_idx = key_offset + (idx - encoded_offset);
        bits >>= key_idx % 8;
        let Some(slot) = key.get_mut(key_idx / 8) else {
            break;
        };
        *slot |= bits;
    }

    PublicKey(key.map(|b| !b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_all_zero_key_address() {
        let key = PublicKey::from_bytes([0u8; 32]);
        let addr = address_for_key(&key);
        assert_eq!(addr.ip(), "200::".parse::<Ipv6Addr>().unwrap());
        assert!(addr.is_valid());
    }

    #[test]
    fn test_all_ones_key_address() {
        // Inverted key is all zeros: no leading ones, first bit skipped,
        // remaining bits all zero.
        let key = PublicKey::from_bytes([0xFF; 32]);
        let addr = address_for_key(&key);
        assert_eq!(addr.as_bytes()[0], 0x02);
        assert_eq!(addr.as_bytes()[1], 0);
        assert!(addr.as_bytes()[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_leading_zero_bits_counted() {
        let mut bytes = [0xFFu8; 32];
        bytes[0] = 0x00;
        bytes[1] = 0x3F; // 8 + 2 leading zero bits, then a one
        let addr = address_for_key(&PublicKey::from_bytes(bytes));
        assert_eq!(addr.as_bytes()[1], 10);
        // Everything after the terminating bit is inverted 0xFF -> 0x00
        assert!(addr.as_bytes()[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_packed_bits_follow_terminator() {
        // Inverted key: 0b0101_0101... => zero leading ones, skip the first
        // zero, then the packed stream starts "1010_1010".
        let key = PublicKey::from_bytes([0xAA; 32]);
        let addr = address_for_key(&key);
        assert_eq!(addr.as_bytes()[1], 0);
        assert_eq!(addr.as_bytes()[2], 0xAA);
        assert_eq!(addr.as_bytes()[15], 0xAA);
    }

    #[test]
    fn test_subnet_shares_address_prefix() {
        let key = PublicKey::from_bytes([0x5A; 32]);
        let addr = address_for_key(&key);
        let snet = subnet_for_key(&key);
        assert!(snet.is_valid());
        assert_eq!(snet.as_bytes()[0], 0x03);
        assert_eq!(&snet.as_bytes()[1..], &addr.as_bytes()[1..8]);
        assert!(snet.to_string().ends_with("/64"));
    }

    #[test]
    fn test_overlay_membership() {
        let (net, len) = overlay_network();
        assert_eq!(net, "200::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(len, 7);
        assert!(is_overlay_ip(&"200::1".parse().unwrap()));
        assert!(is_overlay_ip(&"3ff::1".parse().unwrap()));
        assert!(!is_overlay_ip(&"400::1".parse().unwrap()));
        assert!(!is_overlay_ip(&"fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_from_hex_errors_name_input() {
        let err = PublicKey::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            AddressError::InvalidKeyLength {
                input: "abcd".to_string(),
                len: 2
            }
        );
        assert!(err.to_string().contains("abcd"));

        let err = PublicKey::from_hex("zz").unwrap_err();
        assert!(matches!(err, AddressError::InvalidHex { .. }));
        assert!(err.to_string().contains("zz"));
    }

    #[test]
    fn test_from_slice_rejects_short_keys() {
        assert!(PublicKey::from_slice(&[1u8; 31]).is_err());
        assert!(PublicKey::from_slice(&[1u8; 32]).is_ok());
    }

    #[test]
    fn test_public_key_hex_display() {
        let key = PublicKey::from_bytes([0xAB; 32]);
        assert_eq!(key.to_string(), "ab".repeat(32));
        assert_eq!("ab".repeat(32).parse::<PublicKey>().unwrap(), key);
    }

    proptest! {
        #[test]
        fn prop_address_always_in_overlay(bytes in prop::array::uniform32(any::<u8>())) {
            let addr = address_for_key(&PublicKey::from_bytes(bytes));
            prop_assert!(addr.is_valid());
            prop_assert!(is_overlay_ip(&addr.ip()));
        }

        #[test]
        fn prop_partial_key_rederives_address(bytes in prop::array::uniform32(any::<u8>())) {
            let addr = address_for_key(&PublicKey::from_bytes(bytes));
            prop_assert_eq!(address_for_key(&addr.partial_key()), addr);
        }

        #[test]
        fn prop_partial_key_rederives_subnet(bytes in prop::array::uniform32(any::<u8>())) {
            let snet = subnet_for_key(&PublicKey::from_bytes(bytes));
            prop_assert_eq!(subnet_for_key(&snet.partial_key()), snet);
        }
    }
}
