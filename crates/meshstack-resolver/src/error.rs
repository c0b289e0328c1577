//! Resolver error types

use meshstack_core::AddressError;
use meshstack_netstack::StackError;
use std::io;
use thiserror::Error;

/// A single DNS lookup failed
#[derive(Debug, Error)]
pub enum DnsError {
    // ============ Codec Errors ============
    /// Message shorter than its header or a field it declares
    #[error("DNS message truncated at offset {0}")]
    Truncated(usize),

    /// Label longer than 63 bytes, empty label or name over 255 bytes
    #[error("invalid DNS name {0:?}")]
    InvalidName(String),

    /// Compression pointers form a loop or point forward
    #[error("bad compression pointer at offset {0}")]
    BadPointer(usize),

    /// Label type bits other than plain or pointer
    #[error("unsupported label type {0:#04x}")]
    UnsupportedLabel(u8),

    // ============ Exchange Errors ============
    /// Response id does not match the query
    #[error("response id {got:#06x} does not match query id {expected:#06x}")]
    IdMismatch {
        /// Query id
        expected: u16,
        /// Response id
        got: u16,
    },

    /// Response question differs from the one asked
    #[error("response answers a different question")]
    QuestionMismatch,

    /// Message is not a response
    #[error("expected a DNS response, got a query")]
    NotAResponse,

    /// The name does not exist
    #[error("name does not exist (NXDOMAIN)")]
    NxDomain,

    /// The server failed
    #[error("server failure (SERVFAIL)")]
    ServFail,

    /// Any other non-zero response code
    #[error("server returned response code {0}")]
    Rcode(u8),

    /// The response carried no record of the requested type
    #[error("no records in answer")]
    NoAnswer,

    // ============ Transport Errors ============
    /// Dialing the nameserver failed
    #[error("nameserver unreachable: {0}")]
    Stack(StackError),

    /// Reading or writing the exchange failed
    #[error("DNS exchange I/O: {0}")]
    Io(#[from] io::Error),

    /// The caller cancelled the lookup
    #[error("lookup cancelled")]
    Cancelled,
}

impl From<StackError> for DnsError {
    fn from(err: StackError) -> Self {
        match err {
            StackError::Cancelled => Self::Cancelled,
            other => Self::Stack(other),
        }
    }
}

/// Name resolution failed
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Public-key name whose key part is not 32 bytes of hex
    #[error("invalid public-key name {name:?}: {source}")]
    InvalidKeyName {
        /// The name as given
        name: String,
        /// Decoding failure
        #[source]
        source: AddressError,
    },

    /// Name is neither a key name nor a literal and DNS is not available
    #[error("no nameserver configured to resolve {0:?}")]
    NoNameserver(String),

    /// Configured nameserver string could not be parsed
    #[error("invalid nameserver {input:?}: {reason}")]
    InvalidNameserver {
        /// Offending input
        input: String,
        /// What was wrong with it
        reason: &'static str,
    },

    /// Both the AAAA and the A lookup failed
    #[error("could not resolve {name:?}: AAAA lookup: {aaaa}; A lookup: {a}")]
    LookupFailed {
        /// The name as given
        name: String,
        /// Why the AAAA lookup failed
        aaaa: DnsError,
        /// Why the A lookup failed
        a: DnsError,
    },

    /// The caller cancelled resolution
    #[error("resolution of {0:?} cancelled")]
    Cancelled(String),
}
