//! # meshstack resolver
//!
//! Hostname resolution for overlay applications:
//!
//! 1. `<hex public key>.pk.ygg` names map straight to the key's overlay
//!    address, with no I/O
//! 2. literal IP addresses pass through unchanged
//! 3. anything else goes to the configured nameserver, and the DNS traffic
//!    itself travels over the overlay through a [`meshstack_netstack::NetStack`]
//!
//! ```no_run
//! use meshstack_resolver::Resolver;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), meshstack_resolver::ResolveError> {
//! let resolver = Resolver::without_nameserver();
//! let ip = resolver.resolve(&CancellationToken::new(), "200::1").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod dns;
pub mod error;
pub mod resolver;

pub use client::{DnsLookup, Nameserver, OverlayDns};
pub use dns::{DNS_PORT, DnsMessage, RecordType, ResourceRecord};
pub use error::{DnsError, ResolveError};
pub use resolver::{PK_NAME_SUFFIX, Resolver, resolve_key_name};
