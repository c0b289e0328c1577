//! Minimal DNS wire codec (RFC 1035) for address lookups.
//!
//! Covers what an A/AAAA client and a test responder need: header, question
//! and answer sections. Encoding never compresses; decoding follows
//! compression pointers. Authority and additional sections are ignored.
//!
//! ```text
//!  0  1  2  3  4  5  6  7  8  9 10 11 12 13 14 15
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                      ID                       |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |QR|  Opcode   |AA|TC|RD|RA|   Z    |   RCODE   |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |          QDCOUNT / ANCOUNT / NSCOUNT / ARCOUNT |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! ```

use crate::error::DnsError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Default nameserver port
pub const DNS_PORT: u16 = 53;

/// Fixed header size
pub const HEADER_LEN: usize = 12;

/// Largest UDP response we accept
pub const MAX_UDP_MESSAGE: usize = 4096;

const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_JUMPS: usize = 32;

/// Internet class
pub const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const RCODE_MASK: u16 = 0x000F;

/// Response code: no error
pub const RCODE_NOERROR: u8 = 0;
/// Response code: server failure
pub const RCODE_SERVFAIL: u8 = 2;
/// Response code: name does not exist
pub const RCODE_NXDOMAIN: u8 = 3;

/// Address record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// IPv4 address
    A,
    /// IPv6 address
    Aaaa,
}

impl RecordType {
    /// Wire type code
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Aaaa => 28,
        }
    }

    /// Record type for a wire code, if it is an address type
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::A),
            28 => Some(Self::Aaaa),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
        })
    }
}

/// Question section entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Queried name, without the trailing dot
    pub name: String,
    /// Query type code
    pub qtype: u16,
    /// Query class
    pub qclass: u16,
}

impl Question {
    /// Whether `other` asks the same thing (names compare case-insensitively)
    #[must_use]
    pub fn matches(&self, other: &Question) -> bool {
        self.qtype == other.qtype
            && self.qclass == other.qclass
            && self.name.eq_ignore_ascii_case(&other.name)
    }
}

/// Decoded record data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// A record
    A(Ipv4Addr),
    /// AAAA record
    Aaaa(Ipv6Addr),
    /// Anything else, raw
    Other(Vec<u8>),
}

/// Answer section entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    /// Owner name
    pub name: String,
    /// Type code
    pub rtype: u16,
    /// Class
    pub class: u16,
    /// Time to live in seconds
    pub ttl: u32,
    /// Record data
    pub data: RecordData,
}

impl ResourceRecord {
    /// Address record for `name`
    #[must_use]
    pub fn address(name: &str, ttl: u32, addr: IpAddr) -> Self {
        let (rtype, data) = match addr {
            IpAddr::V4(v4) => (RecordType::A, RecordData::A(v4)),
            IpAddr::V6(v6) => (RecordType::Aaaa, RecordData::Aaaa(v6)),
        };
        Self {
            name: normalize_name(name).to_string(),
            rtype: rtype.code(),
            class: CLASS_IN,
            ttl,
            data,
        }
    }

    /// The carried address, for A and AAAA records
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        match self.data {
            RecordData::A(v4) => Some(IpAddr::V4(v4)),
            RecordData::Aaaa(v6) => Some(IpAddr::V6(v6)),
            RecordData::Other(_) => None,
        }
    }
}

/// A DNS message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    /// Transaction id
    pub id: u16,
    /// Header flags including opcode and response code
    pub flags: u16,
    /// Question section
    pub questions: Vec<Question>,
    /// Answer section
    pub answers: Vec<ResourceRecord>,
}

impl DnsMessage {
    /// Recursive query for `name` with a random id
    #[must_use]
    pub fn query(name: &str, rtype: RecordType) -> Self {
        Self::query_with_id(rand::random(), name, rtype)
    }

    /// Recursive query with a fixed id
    #[must_use]
    pub fn query_with_id(id: u16, name: &str, rtype: RecordType) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            questions: vec![Question {
                name: normalize_name(name).to_string(),
                qtype: rtype.code(),
                qclass: CLASS_IN,
            }],
            answers: Vec::new(),
        }
    }

    /// Response to this message carrying `answers`
    #[must_use]
    pub fn reply(&self, rcode: u8, answers: Vec<ResourceRecord>) -> Self {
        Self {
            id: self.id,
            flags: FLAG_QR | (self.flags & FLAG_RD) | FLAG_RA | (u16::from(rcode) & RCODE_MASK),
            questions: self.questions.clone(),
            answers,
        }
    }

    /// QR bit
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    /// TC bit: the answer did not fit and should be retried over TCP
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    /// Set or clear the TC bit
    pub fn set_truncated(&mut self, truncated: bool) {
        if truncated {
            self.flags |= FLAG_TC;
        } else {
            self.flags &= !FLAG_TC;
        }
    }

    /// Response code
    #[must_use]
    pub fn rcode(&self) -> u8 {
        (self.flags & RCODE_MASK) as u8
    }

    /// Addresses of the given type in answer order
    #[must_use]
    pub fn addresses(&self, rtype: RecordType) -> Vec<IpAddr> {
        self.answers
            .iter()
            .filter(|record| record.rtype == rtype.code())
            .filter_map(ResourceRecord::ip)
            .collect()
    }

    /// Encode to wire format
    ///
    /// # Errors
    ///
    /// Returns `DnsError::InvalidName` for names with empty or oversized
    /// labels.
    pub fn encode(&self) -> Result<Vec<u8>, DnsError> {
        let mut bytes = Vec::with_capacity(512);

        bytes.extend_from_slice(&self.id.to_be_bytes());
        bytes.extend_from_slice(&self.flags.to_be_bytes());
        bytes.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        // NSCOUNT, ARCOUNT
        bytes.extend_from_slice(&[0u8; 4]);

        for question in &self.questions {
            write_name(&mut bytes, &question.name)?;
            bytes.extend_from_slice(&question.qtype.to_be_bytes());
            bytes.extend_from_slice(&question.qclass.to_be_bytes());
        }

        for record in &self.answers {
            write_name(&mut bytes, &record.name)?;
            bytes.extend_from_slice(&record.rtype.to_be_bytes());
            bytes.extend_from_slice(&record.class.to_be_bytes());
            bytes.extend_from_slice(&record.ttl.to_be_bytes());
            let rdata = match &record.data {
                RecordData::A(v4) => v4.octets().to_vec(),
                RecordData::Aaaa(v6) => v6.octets().to_vec(),
                RecordData::Other(raw) => raw.clone(),
            };
            bytes.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            bytes.extend_from_slice(&rdata);
        }

        Ok(bytes)
    }

    /// Decode from wire format
    ///
    /// # Errors
    ///
    /// Returns a codec `DnsError` for truncated or malformed messages.
    pub fn decode(bytes: &[u8]) -> Result<Self, DnsError> {
        if bytes.len() < HEADER_LEN {
            return Err(DnsError::Truncated(bytes.len()));
        }

        let id = read_u16(bytes, 0)?;
        let flags = read_u16(bytes, 2)?;
        let qdcount = read_u16(bytes, 4)?;
        let ancount = read_u16(bytes, 6)?;

        let mut offset = HEADER_LEN;

        let mut questions = Vec::with_capacity(usize::from(qdcount).min(4));
        for _ in 0..qdcount {
            let (name, next) = read_name(bytes, offset)?;
            let qtype = read_u16(bytes, next)?;
            let qclass = read_u16(bytes, next + 2)?;
            questions.push(Question { name, qtype, qclass });
            offset = next + 4;
        }

        let mut answers = Vec::with_capacity(usize::from(ancount).min(16));
        for _ in 0..ancount {
            let (name, next) = read_name(bytes, offset)?;
            let rtype = read_u16(bytes, next)?;
            let class = read_u16(bytes, next + 2)?;
            let ttl = read_u32(bytes, next + 4)?;
            let rdlength = usize::from(read_u16(bytes, next + 8)?);

            let rdata_start = next + 10;
            let rdata = bytes
                .get(rdata_start..rdata_start + rdlength)
                .ok_or(DnsError::Truncated(rdata_start))?;

            let data = match (RecordType::from_code(rtype), rdata.len()) {
                (Some(RecordType::A), 4) => {
                    RecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
                }
                (Some(RecordType::Aaaa), 16) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(rdata);
                    RecordData::Aaaa(Ipv6Addr::from(octets))
                }
                _ => RecordData::Other(rdata.to_vec()),
            };

            answers.push(ResourceRecord {
                name,
                rtype,
                class,
                ttl,
                data,
            });
            offset = rdata_start + rdlength;
        }

        Ok(Self {
            id,
            flags,
            questions,
            answers,
        })
    }
}

fn normalize_name(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, DnsError> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DnsError::Truncated(offset))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, DnsError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DnsError::Truncated(offset))
}

fn write_name(out: &mut Vec<u8>, name: &str) -> Result<(), DnsError> {
    let name = normalize_name(name);
    let mut wire_len = 1;
    if !name.is_empty() {
        for label in name.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(DnsError::InvalidName(name.to_string()));
            }
            wire_len += label.len() + 1;
            if wire_len > MAX_NAME_LEN {
                return Err(DnsError::InvalidName(name.to_string()));
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    Ok(())
}

/// Read a possibly compressed name at `start`.
///
/// Returns the dotted name and the offset just past the name at its original
/// position. Pointers must point strictly backwards.
fn read_name(msg: &[u8], start: usize) -> Result<(String, usize), DnsError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut resume = None;
    let mut jumps = 0;
    let mut wire_len = 1;

    loop {
        let len = *msg.get(pos).ok_or(DnsError::Truncated(pos))?;
        match len & 0xC0 {
            0x00 if len == 0 => {
                return Ok((labels.join("."), resume.unwrap_or(pos + 1)));
            }
            0x00 => {
                let label_start = pos + 1;
                let label_end = label_start + usize::from(len);
                let label = msg
                    .get(label_start..label_end)
                    .ok_or(DnsError::Truncated(label_start))?;
                wire_len += label.len() + 1;
                if wire_len > MAX_NAME_LEN {
                    return Err(DnsError::InvalidName(labels.join(".")));
                }
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos = label_end;
            }
            0xC0 => {
                let low = *msg.get(pos + 1).ok_or(DnsError::Truncated(pos + 1))?;
                let target = usize::from(u16::from_be_bytes([len & 0x3F, low]));
                if target >= pos || jumps >= MAX_POINTER_JUMPS {
                    return Err(DnsError::BadPointer(pos));
                }
                resume.get_or_insert(pos + 2);
                jumps += 1;
                pos = target;
            }
            other => return Err(DnsError::UnsupportedLabel(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_query_wire_format() {
        let query = DnsMessage::query_with_id(0xBEEF, "mesh.example.", RecordType::Aaaa);
        let bytes = query.encode().unwrap();

        let mut expected = vec![0xBE, 0xEF, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        expected.extend_from_slice(b"\x04mesh\x07example\x00");
        expected.extend_from_slice(&[0, 28, 0, 1]);
        assert_eq!(bytes, expected);
        assert!(!query.is_response());
    }

    #[test]
    fn test_decode_compressed_answers() {
        // Response for mesh.example AAAA with two answers pointing at the question name
        let mut msg = vec![0x12, 0x34, 0x81, 0x80, 0, 1, 0, 2, 0, 0, 0, 0];
        msg.extend_from_slice(b"\x04mesh\x07example\x00");
        msg.extend_from_slice(&[0, 28, 0, 1]);
        for last in [1u8, 2] {
            msg.extend_from_slice(&[0xC0, 0x0C, 0, 28, 0, 1, 0, 0, 0x0E, 0x10, 0, 16]);
            let mut addr = [0u8; 16];
            addr[0] = 0x02;
            addr[15] = last;
            msg.extend_from_slice(&addr);
        }

        let response = DnsMessage::decode(&msg).unwrap();
        assert_eq!(response.id, 0x1234);
        assert!(response.is_response());
        assert!(!response.is_truncated());
        assert_eq!(response.rcode(), RCODE_NOERROR);
        assert_eq!(response.questions[0].name, "mesh.example");
        assert_eq!(response.answers.len(), 2);
        assert_eq!(response.answers[0].name, "mesh.example");
        assert_eq!(response.answers[0].ttl, 3600);
        assert_eq!(
            response.addresses(RecordType::Aaaa),
            vec![
                "200::1".parse::<IpAddr>().unwrap(),
                "200::2".parse::<IpAddr>().unwrap()
            ]
        );
        assert!(response.addresses(RecordType::A).is_empty());
    }

    #[test]
    fn test_pointer_into_label_suffix() {
        // www.mesh.example where "mesh.example" is reached through a pointer
        let mut msg = vec![0, 1, 0x80, 0, 0, 2, 0, 0, 0, 0, 0, 0];
        msg.extend_from_slice(b"\x04mesh\x07example\x00");
        msg.extend_from_slice(&[0, 1, 0, 1]);
        msg.extend_from_slice(b"\x03www\xC0\x0C");
        msg.extend_from_slice(&[0, 1, 0, 1]);

        let decoded = DnsMessage::decode(&msg).unwrap();
        assert_eq!(decoded.questions[1].name, "www.mesh.example");
    }

    #[test]
    fn test_rejects_pointer_loops_and_truncation() {
        let mut looped = vec![0, 1, 0x80, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        looped.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1]);
        assert!(matches!(DnsMessage::decode(&looped), Err(DnsError::BadPointer(12))));

        assert!(matches!(DnsMessage::decode(&[0u8; 5]), Err(DnsError::Truncated(5))));

        let query = DnsMessage::query_with_id(7, "a.b", RecordType::A).encode().unwrap();
        assert!(matches!(
            DnsMessage::decode(&query[..query.len() - 2]),
            Err(DnsError::Truncated(_))
        ));
    }

    #[test]
    fn test_reply_flags() {
        let query = DnsMessage::query_with_id(9, "mesh.example", RecordType::A);
        let mut reply = query.reply(
            RCODE_NXDOMAIN,
            vec![ResourceRecord::address("mesh.example", 60, "10.1.2.3".parse().unwrap())],
        );
        assert!(reply.is_response());
        assert_eq!(reply.id, 9);
        assert_eq!(reply.rcode(), RCODE_NXDOMAIN);
        assert!(reply.questions[0].matches(&query.questions[0]));

        reply.set_truncated(true);
        let decoded = DnsMessage::decode(&reply.encode().unwrap()).unwrap();
        assert!(decoded.is_truncated());
        assert_eq!(decoded.addresses(RecordType::A), vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_invalid_names() {
        let long_label = "a".repeat(64);
        assert!(matches!(
            DnsMessage::query_with_id(1, &long_label, RecordType::A).encode(),
            Err(DnsError::InvalidName(_))
        ));
        assert!(matches!(
            DnsMessage::query_with_id(1, "a..b", RecordType::A).encode(),
            Err(DnsError::InvalidName(_))
        ));
        let long_name = vec!["abcdefghij"; 30].join(".");
        assert!(matches!(
            DnsMessage::query_with_id(1, &long_name, RecordType::A).encode(),
            Err(DnsError::InvalidName(_))
        ));
    }

    #[test]
    fn test_question_match_ignores_case() {
        let a = Question {
            name: "Mesh.Example".to_string(),
            qtype: 28,
            qclass: CLASS_IN,
        };
        let mut b = a.clone();
        b.name = "mesh.example".to_string();
        assert!(a.matches(&b));
        b.qtype = 1;
        assert!(!a.matches(&b));
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..300)) {
            let _ = DnsMessage::decode(&bytes);
        }
    }
}
