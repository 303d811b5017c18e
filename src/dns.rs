//! DNS plumbing shared by the authenticator and the URL checker: A/AAAA
//! lookups behind a trait, and DNS blacklist query helpers.

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::config::{DnsProvider, ThreatConfig};

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("DNS lookup timed out for {0}")]
    Timeout(String),
    #[error("DNS lookup failed for {name}: {message}")]
    Resolve { name: String, message: String },
    #[error("Failed to create DNS resolver: {0}")]
    Setup(String),
}

#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// A records for `name`. A name without records is an empty list, not an error.
    async fn lookup_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError>;
    async fn lookup_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError>;
}

pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryLookup {
    pub fn new(provider: DnsProvider, timeout: Duration) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        // DNSBL answers change quickly and are cached one level up.
        opts.cache_size = 0;

        let resolver = match provider {
            DnsProvider::System => TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| DnsError::Setup(e.to_string()))?,
            DnsProvider::Cloudflare => TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), opts),
            DnsProvider::Google => TokioAsyncResolver::tokio(ResolverConfig::google(), opts),
        };

        Ok(HickoryLookup { resolver, timeout })
    }

    pub fn from_config(config: &ThreatConfig) -> Result<Self, DnsError> {
        Self::new(
            config.dns_provider,
            Duration::from_secs(config.dns_timeout_seconds),
        )
    }
}

fn resolve_error(name: &str, e: hickory_resolver::error::ResolveError) -> Result<(), DnsError> {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Ok(()),
        _ => Err(DnsError::Resolve {
            name: name.to_string(),
            message: e.to_string(),
        }),
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn lookup_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        log::debug!("A lookup for {name}");
        match tokio::time::timeout(self.timeout, self.resolver.ipv4_lookup(name)).await {
            Ok(Ok(response)) => Ok(response.iter().map(|a| a.0).collect()),
            Ok(Err(e)) => resolve_error(name, e).map(|_| Vec::new()),
            Err(_) => Err(DnsError::Timeout(name.to_string())),
        }
    }

    async fn lookup_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        log::debug!("AAAA lookup for {name}");
        match tokio::time::timeout(self.timeout, self.resolver.ipv6_lookup(name)).await {
            Ok(Ok(response)) => Ok(response.iter().map(|aaaa| aaaa.0).collect()),
            Ok(Err(e)) => resolve_error(name, e).map(|_| Vec::new()),
            Err(_) => Err(DnsError::Timeout(name.to_string())),
        }
    }
}

/// Reverse an address into the label form DNSBLs expect:
/// `1.2.3.4` becomes `4.3.2.1`, IPv6 becomes its 32 reversed nibbles.
pub fn format_for_dnsbl(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}")
        }
        IpAddr::V6(v6) => {
            let hex: String = v6.segments().iter().map(|s| format!("{s:04x}")).collect();
            let nibbles: Vec<String> = hex.chars().rev().map(|c| c.to_string()).collect();
            nibbles.join(".")
        }
    }
}

/// A blacklist answer counts as a listing unless it is empty or every record
/// is a `127.255.x.x` sentinel (the list refused to answer our resolver).
pub fn is_listed(answers: &[Ipv4Addr]) -> bool {
    if answers.is_empty() {
        return false;
    }
    !answers
        .iter()
        .all(|a| a.octets()[0] == 127 && a.octets()[1] == 255)
}

/// Query `<label>.<list>` against each list in order and return the first list
/// reporting a listing. Lookup failures count as "not listed".
pub async fn first_listing(dns: &dyn DnsLookup, label: &str, lists: &[String]) -> Option<String> {
    for list in lists {
        let query = format!("{label}.{list}");
        match dns.lookup_a(&query).await {
            Ok(answers) if is_listed(&answers) => {
                log::info!("{label} is listed on {list}");
                return Some(list.clone());
            }
            Ok(_) => {}
            Err(e) => log::debug!("Blacklist query {query} failed: {e}"),
        }
    }
    None
}

/// Resolve a hostname to one address, preferring IPv6.
pub async fn resolve_host(dns: &dyn DnsLookup, host: &str) -> Option<IpAddr> {
    match dns.lookup_aaaa(host).await {
        Ok(v6) if !v6.is_empty() => return Some(IpAddr::V6(v6[0])),
        Ok(_) => {}
        Err(e) => log::debug!("AAAA lookup for {host} failed: {e}"),
    }
    match dns.lookup_a(host).await {
        Ok(v4) if !v4.is_empty() => Some(IpAddr::V4(v4[0])),
        Ok(_) => None,
        Err(e) => {
            log::debug!("A lookup for {host} failed: {e}");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory resolver for tests. Unknown names resolve to nothing.
    #[derive(Default)]
    pub struct StaticDns {
        pub a: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
        pub aaaa: Mutex<HashMap<String, Vec<Ipv6Addr>>>,
        pub queries: Mutex<Vec<String>>,
    }

    impl StaticDns {
        pub fn with_a(self, name: &str, ip: Ipv4Addr) -> Self {
            self.a.lock().entry(name.to_string()).or_default().push(ip);
            self
        }

        pub fn query_count(&self) -> usize {
            self.queries.lock().len()
        }
    }

    #[async_trait]
    impl DnsLookup for StaticDns {
        async fn lookup_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
            self.queries.lock().push(name.to_string());
            Ok(self.a.lock().get(name).cloned().unwrap_or_default())
        }

        async fn lookup_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
            self.queries.lock().push(name.to_string());
            Ok(self.aaaa.lock().get(name).cloned().unwrap_or_default())
        }
    }
}
