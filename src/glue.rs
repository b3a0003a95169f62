//! Authoritative nameserver discovery
//!
//! Resolves the glue IPs of the nameservers authoritative for a domain by
//! walking the delegation chain manually, starting from the DNS roots. The
//! local recursive resolver is deliberately bypassed: when the domain's
//! authoritative NS set is served by this very cluster, asking a recursor
//! would loop straight back to us.
//!
//! Results are cached in memory with the delegation TTL, clamped to a
//! floor so a zero-TTL parent cannot turn every peer lookup into a full
//! root walk.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{Resolver, TokioResolver};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Minimum cache lifetime for a resolved NS set, in seconds.
const MIN_CACHE_TTL: u32 = 30;

/// Per-query exchange timeout.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delegation walk depth cap; real chains are 2-4 hops deep.
const MAX_DELEGATION_DEPTH: usize = 16;

/// Errors from the glue resolution walk
#[derive(Debug, Error)]
pub enum GlueError {
    /// A single DNS exchange failed (socket, timeout, or malformed reply)
    #[error("dns exchange with {server} failed: {message}")]
    Exchange { server: String, message: String },

    /// No authority in the current set produced a usable response
    #[error("no authority answered for '{fqdn}': {message}")]
    NoAuthority { fqdn: String, message: String },

    /// The query name could not be encoded
    #[error("invalid query name '{fqdn}': {message}")]
    InvalidName { fqdn: String, message: String },
}

fn root_servers() -> &'static [String] {
    static ROOTS: OnceLock<Vec<String>> = OnceLock::new();
    ROOTS.get_or_init(|| {
        (b'a'..=b'm')
            .map(|c| format!("{}.root-servers.net", c as char))
            .collect()
    })
}

/// Source of the authoritative nameserver IPs for a domain.
///
/// Implemented by [`GlueResolver`]; peer-facing components depend on the
/// trait so tests can pin the peer set directly.
#[async_trait]
pub trait IpSource: Send + Sync {
    async fn ips(&self, fqdn: &str) -> Result<Vec<IpAddr>, GlueError>;
}

#[async_trait]
impl IpSource for GlueResolver {
    async fn ips(&self, fqdn: &str) -> Result<Vec<IpAddr>, GlueError> {
        self.resolve_ips(fqdn).await
    }
}

/// A single DNS round trip to a named or numbered authority.
///
/// Seam between the walk logic and the network so tests can script entire
/// delegation chains in-process.
#[async_trait]
pub trait DnsExchange: Send + Sync {
    async fn exchange(&self, query: &Message, server: &str) -> Result<Message, GlueError>;
}

/// UDP exchange on port 53.
///
/// Authorities appear either as IP literals (glue) or as hostnames (the
/// roots, and glueless NS); hostnames go through the local stub resolver,
/// which is safe because they are never names the cluster serves itself.
pub struct UdpExchange {
    resolver: TokioResolver,
    timeout: Duration,
}

impl UdpExchange {
    pub fn new() -> Self {
        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self {
            resolver,
            timeout: EXCHANGE_TIMEOUT,
        }
    }

    async fn server_addr(&self, server: &str) -> Result<IpAddr, GlueError> {
        if let Ok(ip) = server.trim_end_matches('.').parse::<IpAddr>() {
            return Ok(ip);
        }
        let lookup = self
            .resolver
            .lookup_ip(server)
            .await
            .map_err(|e| GlueError::Exchange {
                server: server.to_string(),
                message: e.to_string(),
            })?;
        lookup.iter().next().ok_or_else(|| GlueError::Exchange {
            server: server.to_string(),
            message: "hostname resolved to no addresses".to_string(),
        })
    }
}

impl Default for UdpExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsExchange for UdpExchange {
    async fn exchange(&self, query: &Message, server: &str) -> Result<Message, GlueError> {
        let err = |message: String| GlueError::Exchange {
            server: server.to_string(),
            message,
        };

        let ip = self.server_addr(server).await?;
        let bind = if ip.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await.map_err(|e| err(e.to_string()))?;
        let wire = query.to_vec().map_err(|e| err(e.to_string()))?;

        tokio::time::timeout(self.timeout, async {
            socket
                .send_to(&wire, (ip, 53))
                .await
                .map_err(|e| err(e.to_string()))?;
            let mut buf = [0u8; 4096];
            loop {
                let (n, _) = socket
                    .recv_from(&mut buf)
                    .await
                    .map_err(|e| err(e.to_string()))?;
                let response = Message::from_vec(&buf[..n]).map_err(|e| err(e.to_string()))?;
                if response.id() == query.id() {
                    return Ok(response);
                }
            }
        })
        .await
        .map_err(|_| err("timed out".to_string()))?
    }
}

struct CacheEntry {
    ips: Vec<IpAddr>,
    valid_until: Instant,
}

/// Iterative glue resolver with a TTL cache.
pub struct GlueResolver {
    exchange: Arc<dyn DnsExchange>,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl GlueResolver {
    pub fn new() -> Self {
        Self::with_exchange(Arc::new(UdpExchange::new()))
    }

    pub fn with_exchange(exchange: Arc<dyn DnsExchange>) -> Self {
        Self {
            exchange,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the glue IPs of the nameservers authoritative for `fqdn`.
    ///
    /// Walks from the roots: each response's AUTHORITY section names the
    /// next delegation level, with the ADDITIONAL section carrying glue.
    /// When an NS record's owner equals the query name itself, the response
    /// came from the parent of the authoritative zone and the glue gathered
    /// there is the answer.
    pub async fn resolve_ips(&self, fqdn: &str) -> Result<Vec<IpAddr>, GlueError> {
        let mut key = fqdn.to_ascii_lowercase();
        if !key.ends_with('.') {
            key.push('.');
        }

        if let Some(ips) = self.cached(&key) {
            trace!(fqdn = %key, count = ips.len(), "glue cache hit");
            return Ok(ips);
        }

        let qname = Name::from_ascii(&key).map_err(|e| GlueError::InvalidName {
            fqdn: key.clone(),
            message: e.to_string(),
        })?;

        let mut auths: Vec<String> = root_servers().to_vec();
        let mut min_ttl: Option<u32> = None;

        for _ in 0..MAX_DELEGATION_DEPTH {
            let response = self.query_first(&qname, &auths, &key).await?;

            let mut ns_eq_qname = false;
            let mut new_auths: Vec<String> = Vec::new();
            for record in response.name_servers() {
                let RData::NS(ns) = record.data() else {
                    continue;
                };
                if record.name() == &qname {
                    ns_eq_qname = true;
                }
                min_ttl = Some(min_ttl.map_or(record.ttl(), |t| t.min(record.ttl())));

                let mut resolved = false;
                for extra in response.additionals() {
                    if extra.name() != &ns.0 {
                        continue;
                    }
                    match extra.data() {
                        RData::A(a) => {
                            new_auths.push(a.0.to_string());
                            resolved = true;
                        }
                        RData::AAAA(aaaa) => {
                            new_auths.push(aaaa.0.to_string());
                            resolved = true;
                        }
                        _ => continue,
                    }
                    min_ttl = Some(min_ttl.map_or(extra.ttl(), |t| t.min(extra.ttl())));
                }
                if !resolved {
                    // No glue; carry the NS by name and let the next
                    // iteration resolve it through the local stack.
                    new_auths.push(ns.0.to_string());
                }
            }

            if ns_eq_qname {
                // Parent-of-authoritative boundary: the glue collected in
                // this response is the authoritative set itself.
                auths = std::mem::take(&mut new_auths);
            }

            if new_auths.is_empty() {
                let ips: Vec<IpAddr> = auths
                    .iter()
                    .filter_map(|a| a.trim_end_matches('.').parse().ok())
                    .collect();
                self.store(&key, &ips, min_ttl.unwrap_or(0));
                debug!(fqdn = %key, count = ips.len(), "resolved authoritative set");
                return Ok(ips);
            }

            auths = new_auths;
        }

        Err(GlueError::NoAuthority {
            fqdn: key,
            message: "delegation chain too deep".to_string(),
        })
    }

    /// Query each authority in order, taking the first clean answer.
    async fn query_first(
        &self,
        qname: &Name,
        auths: &[String],
        fqdn: &str,
    ) -> Result<Message, GlueError> {
        let mut query = Message::new();
        query
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(false);
        query.add_query(Query::query(qname.clone(), RecordType::A));

        let mut fallback: Option<Message> = None;
        let mut last_err: Option<GlueError> = None;
        for auth in auths {
            match self.exchange.exchange(&query, auth).await {
                Ok(resp) if resp.response_code() == ResponseCode::NoError => return Ok(resp),
                Ok(resp) => fallback = Some(resp),
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(resp) = fallback {
            return Ok(resp);
        }
        Err(GlueError::NoAuthority {
            fqdn: fqdn.to_string(),
            message: last_err.map_or_else(|| "no authorities".to_string(), |e| e.to_string()),
        })
    }

    fn cached(&self, fqdn: &str) -> Option<Vec<IpAddr>> {
        let cache = self.cache.read();
        let entry = cache.get(fqdn)?;
        if entry.valid_until > Instant::now() {
            Some(entry.ips.clone())
        } else {
            None
        }
    }

    fn store(&self, fqdn: &str, ips: &[IpAddr], ttl: u32) {
        let ttl = ttl.max(MIN_CACHE_TTL);
        self.cache.write().insert(
            fqdn.to_string(),
            CacheEntry {
                ips: ips.to_vec(),
                valid_until: Instant::now() + Duration::from_secs(u64::from(ttl)),
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn cached_until(&self, fqdn: &str) -> Option<Instant> {
        self.cache.read().get(fqdn).map(|e| e.valid_until)
    }
}

impl Default for GlueResolver {
    fn default() -> Self {
        Self::new()
    }
}
