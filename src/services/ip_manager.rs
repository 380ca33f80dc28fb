// src/services/ip_manager.rs
// =============================================================================
// Rotates between every IP address a shortener answers on.
//
// Some shorteners block a client per target IP. They usually run on many
// addresses, so spreading requests over all of them keeps each one quiet.
//
// How it works:
// 1. For each hostname, ask DNS for its authoritative nameservers (NS)
// 2. Ask each of those nameservers directly for the hostnames' addresses
// 3. Merge and deduplicate everything into a pool
// 4. Hand out addresses round-robin; rebuild the pool every 5 minutes
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use super::ServiceError;

/// How long a resolved pool stays valid.
pub const POOL_TTL: Duration = Duration::from_secs(300);

/// Upper bound for a single DNS query.
const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// The two DNS questions the IP manager needs answered.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Names of the authoritative nameservers for `host`.
    async fn nameservers(&self, host: &str) -> Result<Vec<String>>;

    /// Addresses of `host`, asking `nameserver` directly.
    async fn addresses(&self, nameserver: &str, host: &str) -> Result<Vec<IpAddr>>;
}

/// Round-robin pool of the addresses behind a set of hostnames.
pub struct IpManager {
    hosts: Vec<String>,
    resolver: Arc<dyn NameResolver>,
    pool: Mutex<Pool>,
}

#[derive(Default)]
struct Pool {
    ips: VecDeque<IpAddr>,
    refreshed: Option<Instant>,
}

impl std::fmt::Debug for IpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpManager")
            .field("hosts", &self.hosts)
            .finish_non_exhaustive()
    }
}

impl IpManager {
    pub fn new(hosts: Vec<String>, resolver: Arc<dyn NameResolver>) -> Self {
        Self {
            hosts,
            resolver,
            pool: Mutex::new(Pool::default()),
        }
    }

    /// Returns the next address, refreshing the pool when it is stale.
    ///
    /// The address is taken from the tail and pushed back at the head, so
    /// consecutive calls cycle through the whole pool.
    pub async fn get_ip(&self) -> Result<IpAddr, ServiceError> {
        let mut pool = self.pool.lock().await;

        let stale = pool
            .refreshed
            .map_or(true, |at| at.elapsed() >= POOL_TTL);
        if stale || pool.ips.is_empty() {
            let ips = self.resolve().await;
            if !ips.is_empty() {
                info!("Resolved {} address(es) for {}", ips.len(), self.hosts.join(", "));
                pool.ips = ips.into();
                pool.refreshed = Some(Instant::now());
            }
        }

        let ip = pool.ips.pop_back().ok_or_else(|| {
            ServiceError::Fetch(format!("no addresses found for {}", self.hosts.join(", ")))
        })?;
        pool.ips.push_front(ip);
        Ok(ip)
    }

    // Asks every nameserver of every host for the addresses of every host.
    // Failed or slow queries are skipped; the result keeps first-seen order.
    async fn resolve(&self) -> Vec<IpAddr> {
        let mut nameservers = Vec::new();
        for host in &self.hosts {
            match timeout(DNS_TIMEOUT, self.resolver.nameservers(host)).await {
                Ok(Ok(found)) => {
                    for ns in found {
                        if !nameservers.contains(&ns) {
                            nameservers.push(ns);
                        }
                    }
                }
                Ok(Err(e)) => debug!("NS lookup for {} failed: {:#}", host, e),
                Err(_) => warn!("NS lookup for {} timed out", host),
            }
        }

        let mut seen = HashSet::new();
        let mut ips = Vec::new();
        for nameserver in &nameservers {
            for host in &self.hosts {
                match timeout(DNS_TIMEOUT, self.resolver.addresses(nameserver, host)).await {
                    Ok(Ok(found)) => {
                        for ip in found {
                            if seen.insert(ip) {
                                ips.push(ip);
                            }
                        }
                    }
                    Ok(Err(e)) => debug!("Lookup of {} at {} failed: {:#}", host, nameserver, e),
                    Err(_) => warn!("Lookup of {} at {} timed out", host, nameserver),
                }
            }
        }
        ips
    }
}

/// NameResolver backed by trust-dns.
pub struct DnsResolver {
    system: TokioAsyncResolver,
}

impl DnsResolver {
    /// Uses the default upstream resolvers for NS and nameserver lookups.
    pub fn new() -> Result<Self, ServiceError> {
        let system = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            .map_err(|e| ServiceError::Unexpected(format!("cannot create DNS resolver: {}", e)))?;
        Ok(Self { system })
    }
}

#[async_trait]
impl NameResolver for DnsResolver {
    async fn nameservers(&self, host: &str) -> Result<Vec<String>> {
        let lookup = self
            .system
            .ns_lookup(host)
            .await
            .with_context(|| format!("NS lookup for {}", host))?;
        Ok(lookup.iter().map(|name| name.to_utf8()).collect())
    }

    async fn addresses(&self, nameserver: &str, host: &str) -> Result<Vec<IpAddr>> {
        // First find out where the nameserver itself lives
        let ns_ips: Vec<IpAddr> = self
            .system
            .lookup_ip(nameserver)
            .await
            .with_context(|| format!("resolving nameserver {}", nameserver))?
            .iter()
            .collect();

        // Then ask it directly, bypassing any caching resolver in between
        let group = NameServerConfigGroup::from_ips_clear(&ns_ips, 53, true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let direct = TokioAsyncResolver::tokio(config, ResolverOpts::default())?;
        let lookup = direct
            .lookup_ip(host)
            .await
            .with_context(|| format!("looking up {} at {}", host, nameserver))?;
        Ok(lookup.iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Canned DNS answers plus a counter of how often NS lookups happen
    struct FakeResolver {
        nameservers: HashMap<String, Vec<String>>,
        addresses: HashMap<(String, String), Vec<IpAddr>>,
        ns_queries: AtomicUsize,
    }

    #[async_trait]
    impl NameResolver for FakeResolver {
        async fn nameservers(&self, host: &str) -> Result<Vec<String>> {
            self.ns_queries.fetch_add(1, Ordering::SeqCst);
            self.nameservers
                .get(host)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("NXDOMAIN"))
        }

        async fn addresses(&self, nameserver: &str, host: &str) -> Result<Vec<IpAddr>> {
            Ok(self
                .addresses
                .get(&(nameserver.to_string(), host.to_string()))
                .cloned()
                .unwrap_or_default())
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn fake() -> Arc<FakeResolver> {
        let mut nameservers = HashMap::new();
        nameservers.insert("a.test".to_string(), vec!["ns1.".to_string(), "ns2.".to_string()]);
        // www.a.test is a CNAME in real life, so it has no NS records

        let mut addresses = HashMap::new();
        addresses.insert(("ns1.".into(), "a.test".into()), vec![ip("10.0.0.1"), ip("10.0.0.2")]);
        addresses.insert(("ns2.".into(), "a.test".into()), vec![ip("10.0.0.2")]);
        addresses.insert(("ns2.".into(), "www.a.test".into()), vec![ip("10.0.0.3")]);

        Arc::new(FakeResolver {
            nameservers,
            addresses,
            ns_queries: AtomicUsize::new(0),
        })
    }

    fn manager(resolver: Arc<FakeResolver>) -> IpManager {
        IpManager::new(vec!["a.test".into(), "www.a.test".into()], resolver)
    }

    #[tokio::test]
    async fn test_pool_is_deduplicated_and_rotates() {
        let manager = manager(fake());

        // Pool is [1, 2, 3]; we pop from the tail and push to the head
        assert_eq!(manager.get_ip().await.unwrap(), ip("10.0.0.3"));
        assert_eq!(manager.get_ip().await.unwrap(), ip("10.0.0.2"));
        assert_eq!(manager.get_ip().await.unwrap(), ip("10.0.0.1"));
        assert_eq!(manager.get_ip().await.unwrap(), ip("10.0.0.3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_refreshes_after_ttl() {
        let resolver = fake();
        let manager = manager(resolver.clone());

        manager.get_ip().await.unwrap();
        manager.get_ip().await.unwrap();
        assert_eq!(resolver.ns_queries.load(Ordering::SeqCst), 2);

        tokio::time::advance(POOL_TTL + Duration::from_secs(1)).await;
        manager.get_ip().await.unwrap();
        assert_eq!(resolver.ns_queries.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_empty_pool_is_a_fetch_error() {
        let resolver = Arc::new(FakeResolver {
            nameservers: HashMap::new(),
            addresses: HashMap::new(),
            ns_queries: AtomicUsize::new(0),
        });
        let manager = IpManager::new(vec!["nowhere.test".into()], resolver);
        let err = manager.get_ip().await.unwrap_err();
        assert!(err.is_transient());
    }
}
