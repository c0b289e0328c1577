//! Name resolution with public-key names, literals and DNS, in that order.

use crate::client::{DnsLookup, Nameserver, OverlayDns};
use crate::dns::RecordType;
use crate::error::{DnsError, ResolveError};
use meshstack_core::{PublicKey, address_for_key};
use meshstack_netstack::NetStack;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Suffix marking a name as a hex-encoded public key
pub const PK_NAME_SUFFIX: &str = ".pk.ygg";

/// Resolve a public-key name without any I/O.
///
/// Returns `None` if `name` does not carry the suffix.
///
/// # Errors
///
/// Returns `ResolveError::InvalidKeyName` if the part before the suffix is
/// not exactly 32 bytes of hex.
pub fn resolve_key_name(name: &str) -> Option<Result<IpAddr, ResolveError>> {
    let hex_key = name.strip_suffix(PK_NAME_SUFFIX)?;
    Some(
        PublicKey::from_hex(hex_key)
            .map(|key| IpAddr::V6(address_for_key(&key).ip()))
            .map_err(|source| ResolveError::InvalidKeyName {
                name: name.to_string(),
                source,
            }),
    )
}

/// Hostname resolver.
///
/// Every call recomputes its answer; nothing is cached.
#[derive(Clone, Default)]
pub struct Resolver {
    lookup: Option<Arc<dyn DnsLookup>>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("dns", &self.lookup.is_some())
            .finish()
    }
}

impl Resolver {
    /// Resolver that queries `nameserver` over the overlay.
    ///
    /// A missing or blank nameserver leaves DNS disabled.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::InvalidNameserver` if the nameserver string is
    /// not `host` or `host:port` with a literal host.
    pub fn new(stack: NetStack, nameserver: Option<&str>) -> Result<Self, ResolveError> {
        let nameserver = nameserver.map(str::trim).filter(|ns| !ns.is_empty());
        let Some(nameserver) = nameserver else {
            return Ok(Self::without_nameserver());
        };
        let nameserver = Nameserver::parse(nameserver)?;
        debug!(%nameserver, "DNS over the overlay enabled");
        Ok(Self::with_lookup(Arc::new(OverlayDns::new(stack, nameserver))))
    }

    /// Resolver using a custom DNS lookup
    #[must_use]
    pub fn with_lookup(lookup: Arc<dyn DnsLookup>) -> Self {
        Self {
            lookup: Some(lookup),
        }
    }

    /// Resolver for key names and literals only
    #[must_use]
    pub fn without_nameserver() -> Self {
        Self { lookup: None }
    }

    /// Whether DNS lookups are available
    #[must_use]
    pub fn has_nameserver(&self) -> bool {
        self.lookup.is_some()
    }

    /// Resolve `name` to an address.
    ///
    /// 1. `<64 hex chars>.pk.ygg` maps to the key's overlay address.
    /// 2. A literal IP is returned unchanged.
    /// 3. With a nameserver, AAAA is tried first and A only if AAAA fails;
    ///    the first answer wins.
    /// 4. Otherwise resolution fails.
    ///
    /// # Errors
    ///
    /// - `ResolveError::InvalidKeyName` for malformed key names
    /// - `ResolveError::LookupFailed` if both lookups fail
    /// - `ResolveError::NoNameserver` if DNS is needed but not configured
    /// - `ResolveError::Cancelled` if `ctx` is cancelled during a lookup
    pub async fn resolve(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> Result<IpAddr, ResolveError> {
        if let Some(result) = resolve_key_name(name) {
            return result;
        }

        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(ip);
        }

        let Some(lookup) = &self.lookup else {
            return Err(ResolveError::NoNameserver(name.to_string()));
        };

        let aaaa = match lookup.lookup(ctx, name, RecordType::Aaaa).await {
            Ok(addrs) => return first_answer(name, addrs, RecordType::Aaaa),
            Err(DnsError::Cancelled) => return Err(ResolveError::Cancelled(name.to_string())),
            Err(e) => {
                debug!(name, error = %e, "AAAA lookup failed, falling back to A");
                e
            }
        };

        match lookup.lookup(ctx, name, RecordType::A).await {
            Ok(addrs) => first_answer(name, addrs, RecordType::A),
            Err(DnsError::Cancelled) => Err(ResolveError::Cancelled(name.to_string())),
            Err(a) => {
                warn!(name, "both AAAA and A lookups failed");
                Err(ResolveError::LookupFailed {
                    name: name.to_string(),
                    aaaa,
                    a,
                })
            }
        }
    }
}

fn first_answer(name: &str, addrs: Vec<IpAddr>, rtype: RecordType) -> Result<IpAddr, ResolveError> {
    match addrs.into_iter().next() {
        Some(addr) => {
            debug!(name, %rtype, %addr, "resolved");
            Ok(addr)
        }
        None => Err(ResolveError::LookupFailed {
            name: name.to_string(),
            aaaa: DnsError::NoAnswer,
            a: DnsError::NoAnswer,
        }),
    }
}
