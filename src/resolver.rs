//! Registrar discovery: domain to ranked candidate list.
//!
//! A literal numeric host short-circuits to a single candidate. Otherwise
//! SRV queries run per transport in a fixed preference order (TLS, TCP,
//! UDP, or the single transport forced by `;transport=`), and the merged
//! list is ordered by SRV priority first, query preference second. Hosts
//! without SRV records fall back to a plain A/AAAA lookup.
//!
//! The actual DNS traffic sits behind [`DnsClient`] so tests can swap in
//! a plain record table instead of a live server.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};

use crate::core::{Aor, Error, Result, TransportKind};

/// One (transport, address, port) tuple eligible to receive a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: TransportKind,
    pub addr: SocketAddr,
    /// Host name the candidate was derived from; carries the TLS server
    /// name.
    pub host: String,
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.addr)
    }
}

#[derive(Debug, Clone)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// DNS lookups the resolver needs. `srv` returns an empty list for a name
/// without records; only transport-level trouble is an error.
#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn srv(&self, service: &str) -> Result<Vec<SrvRecord>>;
    async fn host(&self, name: &str) -> Result<Vec<IpAddr>>;
}

/// Production client backed by hickory.
pub struct HickoryDns {
    inner: TokioAsyncResolver,
}

impl HickoryDns {
    /// Resolver from the system configuration, falling back to the
    /// library defaults when no system configuration exists.
    pub fn system() -> Result<Self> {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Ok(HickoryDns { inner })
    }

    /// Resolver talking only to the given server. Deterministic test
    /// injection point for the facade contract.
    pub fn with_test_dns_server(addr: SocketAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut opts = ResolverOpts::default();
        opts.cache_size = 0;
        HickoryDns {
            inner: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

fn empty_on_no_records<T>(err: ResolveError) -> Result<Vec<T>> {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
        _ => Err(Error::ResolutionFailed(err.to_string())),
    }
}

#[async_trait]
impl DnsClient for HickoryDns {
    async fn srv(&self, service: &str) -> Result<Vec<SrvRecord>> {
        match self.inner.srv_lookup(service).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|srv| SrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    port: srv.port(),
                    target: srv.target().to_utf8().trim_end_matches('.').to_string(),
                })
                .collect()),
            Err(e) => empty_on_no_records(e),
        }
    }

    async fn host(&self, name: &str) -> Result<Vec<IpAddr>> {
        match self.inner.lookup_ip(name).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(e) => empty_on_no_records(e),
        }
    }
}

/// Produces the ranked candidate list for an AOR.
pub struct DnsResolver {
    client: Arc<dyn DnsClient>,
}

impl DnsResolver {
    pub fn system() -> Result<Self> {
        Ok(DnsResolver {
            client: Arc::new(HickoryDns::system()?),
        })
    }

    pub fn with_client(client: Arc<dyn DnsClient>) -> Self {
        DnsResolver { client }
    }

    pub fn with_test_dns_server(addr: SocketAddr) -> Self {
        DnsResolver {
            client: Arc::new(HickoryDns::with_test_dns_server(addr)),
        }
    }

    /// Ranked candidates for `aor`, honoring an `outbound` proxy, a forced
    /// transport and the numeric-address shortcut. Fails with
    /// `ResolutionFailed` when no candidate can be produced.
    pub async fn resolve(&self, aor: &Aor) -> Result<Vec<Candidate>> {
        // An explicit outbound proxy bypasses discovery entirely.
        if let Some(outbound) = aor.outbound() {
            let proxy = Aor::parse_uri(outbound)
                .map_err(|_| Error::ResolutionFailed(format!("bad outbound uri: {}", outbound)))?;
            let kind = proxy
                .transport()
                .or_else(|| if proxy.secure() { Some(TransportKind::Tls) } else { None })
                .unwrap_or(TransportKind::Udp);
            return self.host_candidates(&proxy, kind).await;
        }

        let forced = aor
            .transport()
            .or_else(|| if aor.secure() { Some(TransportKind::Tls) } else { None });

        // Numeric host, or an explicit port: no SRV involvement.
        if aor.host.parse::<IpAddr>().is_ok() || aor.port.is_some() {
            let kind = forced.unwrap_or(TransportKind::Udp);
            return self.host_candidates(aor, kind).await;
        }

        let preference: Vec<TransportKind> = match forced {
            Some(kind) => vec![kind],
            None => vec![TransportKind::Tls, TransportKind::Tcp, TransportKind::Udp],
        };

        // Merge SRV targets across transports: SRV priority first, query
        // preference order second.
        let mut entries: Vec<(u16, usize, TransportKind, SrvRecord)> = Vec::new();
        for (pref, kind) in preference.iter().enumerate() {
            let service = format!("{}.{}", kind.srv_service(), aor.host);
            for record in self.client.srv(&service).await? {
                entries.push((record.priority, pref, *kind, record));
            }
        }
        entries.sort_by_key(|(priority, pref, _, _)| (*priority, *pref));

        let mut candidates = Vec::new();
        for (_, _, kind, record) in &entries {
            let ips = if let Ok(ip) = record.target.parse::<IpAddr>() {
                vec![ip]
            } else {
                self.client.host(&record.target).await?
            };
            for ip in ips {
                let cand = Candidate {
                    kind: *kind,
                    addr: SocketAddr::new(ip, record.port),
                    host: aor.host.clone(),
                };
                if !candidates.contains(&cand) {
                    candidates.push(cand);
                }
            }
        }

        if candidates.is_empty() {
            // No SRV records: plain host lookup on the default transport.
            let kind = forced.unwrap_or(TransportKind::Udp);
            return self.host_candidates(aor, kind).await;
        }
        tracing::debug!(host = %aor.host, count = candidates.len(), "resolved candidates");
        Ok(candidates)
    }

    async fn host_candidates(&self, aor: &Aor, kind: TransportKind) -> Result<Vec<Candidate>> {
        let port = aor.port.unwrap_or_else(|| kind.default_port());
        let ips = if let Ok(ip) = aor.host.parse::<IpAddr>() {
            vec![ip]
        } else {
            self.client.host(&aor.host).await?
        };
        let candidates: Vec<Candidate> = ips
            .into_iter()
            .map(|ip| Candidate {
                kind,
                addr: SocketAddr::new(ip, port),
                host: aor.host.clone(),
            })
            .collect();
        if candidates.is_empty() {
            return Err(Error::ResolutionFailed(format!(
                "no address for {}",
                aor.host
            )));
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeDns {
        srv: HashMap<String, Vec<SrvRecord>>,
        hosts: HashMap<String, Vec<IpAddr>>,
    }

    impl FakeDns {
        fn new() -> Self {
            FakeDns {
                srv: HashMap::new(),
                hosts: HashMap::new(),
            }
        }

        fn add_srv(&mut self, service: &str, priority: u16, port: u16, target: &str) {
            self.srv.entry(service.to_string()).or_default().push(SrvRecord {
                priority,
                weight: 0,
                port,
                target: target.to_string(),
            });
        }

        fn add_host(&mut self, name: &str, ip: IpAddr) {
            self.hosts.entry(name.to_string()).or_default().push(ip);
        }
    }

    #[async_trait]
    impl DnsClient for FakeDns {
        async fn srv(&self, service: &str) -> Result<Vec<SrvRecord>> {
            Ok(self.srv.get(service).cloned().unwrap_or_default())
        }

        async fn host(&self, name: &str) -> Result<Vec<IpAddr>> {
            Ok(self.hosts.get(name).cloned().unwrap_or_default())
        }
    }

    fn resolver(fake: FakeDns) -> DnsResolver {
        DnsResolver::with_client(Arc::new(fake))
    }

    #[tokio::test]
    async fn numeric_host_short_circuits() {
        let r = resolver(FakeDns::new());
        let aor = Aor::parse("sip:user@192.0.2.1").unwrap();
        let cands = r.resolve(&aor).await.unwrap();
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].kind, TransportKind::Udp);
        assert_eq!(cands[0].addr, "192.0.2.1:5060".parse().unwrap());
    }

    #[tokio::test]
    async fn numeric_host_with_forced_transport_and_port() {
        let r = resolver(FakeDns::new());
        let aor = Aor::parse("<sip:user@192.0.2.1:5080;transport=tcp>").unwrap();
        let cands = r.resolve(&aor).await.unwrap();
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].kind, TransportKind::Tcp);
        assert_eq!(cands[0].addr.port(), 5080);
    }

    #[tokio::test]
    async fn srv_priority_beats_transport_preference() {
        let mut fake = FakeDns::new();
        fake.add_srv("_sips._tcp.example.com", 20, 5061, "tls.example.com");
        fake.add_srv("_sip._udp.example.com", 10, 5060, "udp.example.com");
        fake.add_host("tls.example.com", "192.0.2.2".parse().unwrap());
        fake.add_host("udp.example.com", "192.0.2.3".parse().unwrap());

        let r = resolver(fake);
        let aor = Aor::parse("sip:user@example.com").unwrap();
        let cands = r.resolve(&aor).await.unwrap();
        assert_eq!(cands.len(), 2);
        // Lower SRV priority wins even though TLS is preferred.
        assert_eq!(cands[0].kind, TransportKind::Udp);
        assert_eq!(cands[1].kind, TransportKind::Tls);
    }

    #[tokio::test]
    async fn equal_priority_follows_preference_order() {
        let mut fake = FakeDns::new();
        fake.add_srv("_sip._tcp.example.com", 10, 5060, "a.example.com");
        fake.add_srv("_sip._udp.example.com", 10, 5060, "a.example.com");
        fake.add_host("a.example.com", "192.0.2.4".parse().unwrap());

        let r = resolver(fake);
        let aor = Aor::parse("sip:user@example.com").unwrap();
        let cands = r.resolve(&aor).await.unwrap();
        assert_eq!(cands[0].kind, TransportKind::Tcp);
        assert_eq!(cands[1].kind, TransportKind::Udp);
    }

    #[tokio::test]
    async fn forced_transport_queries_single_service() {
        let mut fake = FakeDns::new();
        fake.add_srv("_sip._tcp.example.com", 10, 5062, "a.example.com");
        // A UDP record that must not be consulted.
        fake.add_srv("_sip._udp.example.com", 1, 5060, "a.example.com");
        fake.add_host("a.example.com", "192.0.2.5".parse().unwrap());

        let r = resolver(fake);
        let aor = Aor::parse("<sip:user@example.com;transport=tcp>").unwrap();
        let cands = r.resolve(&aor).await.unwrap();
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].kind, TransportKind::Tcp);
        assert_eq!(cands[0].addr.port(), 5062);
    }

    #[tokio::test]
    async fn falls_back_to_host_lookup_without_srv() {
        let mut fake = FakeDns::new();
        fake.add_host("example.com", "192.0.2.6".parse().unwrap());
        let r = resolver(fake);
        let aor = Aor::parse("sip:user@example.com").unwrap();
        let cands = r.resolve(&aor).await.unwrap();
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].kind, TransportKind::Udp);
        assert_eq!(cands[0].addr, "192.0.2.6:5060".parse().unwrap());
    }

    #[tokio::test]
    async fn unresolvable_domain_fails() {
        let r = resolver(FakeDns::new());
        let aor = Aor::parse("sip:user@nowhere.invalid").unwrap();
        let err = r.resolve(&aor).await.unwrap_err();
        assert!(matches!(err, Error::ResolutionFailed(_)));
    }

    #[tokio::test]
    async fn outbound_proxy_bypasses_discovery() {
        let r = resolver(FakeDns::new());
        let aor = Aor::parse(
            "<sip:u:p@example.com>;outbound=\"sip:192.0.2.7:5070;transport=tcp\"",
        )
        .unwrap();
        let cands = r.resolve(&aor).await.unwrap();
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].kind, TransportKind::Tcp);
        assert_eq!(cands[0].addr, "192.0.2.7:5070".parse().unwrap());
    }

    #[tokio::test]
    async fn sips_scheme_forces_tls() {
        let mut fake = FakeDns::new();
        fake.add_srv("_sips._tcp.example.com", 10, 5061, "tls.example.com");
        fake.add_srv("_sip._udp.example.com", 1, 5060, "udp.example.com");
        fake.add_host("tls.example.com", "192.0.2.8".parse().unwrap());
        fake.add_host("udp.example.com", "192.0.2.9".parse().unwrap());

        let r = resolver(fake);
        let aor = Aor::parse("sips:user@example.com").unwrap();
        let cands = r.resolve(&aor).await.unwrap();
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].kind, TransportKind::Tls);
    }
}
