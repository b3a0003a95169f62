//! Peer certificate cache over mTLS
//!
//! Every cluster node answers mTLS connections with SNI/ALPN "zerocert" by
//! writing out its current certificate bundle as PEM. This cache dials all
//! peers in parallel and keeps the freshest bundle any of them returned.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::{Cache, CacheError};
use crate::error::join_errors;
use crate::fanout::race_all;
use crate::glue::IpSource;
use crate::pki::{CertBundle, MTLS_DOMAIN};

/// Per-peer dial + read deadline.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the cluster certificate from peers.
///
/// Storage is not implemented here; compose with [`FileCache`] through a
/// [`LayeredCache`] for persistence. Peers "store" by being reachable.
///
/// [`FileCache`]: super::FileCache
/// [`LayeredCache`]: super::LayeredCache
pub struct TlsCache {
    domain: String,
    port: u16,
    ips: Arc<dyn IpSource>,
    connector: TlsConnector,
}

impl TlsCache {
    /// `domain` is resolved through `ips` (normally the glue resolver) to
    /// the current peer set; `client_config` must present the peer client
    /// leaf and trust the derived CA.
    pub fn new(
        domain: impl Into<String>,
        port: u16,
        ips: Arc<dyn IpSource>,
        client_config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            domain: domain.into(),
            port,
            ips,
            connector: TlsConnector::from(client_config),
        }
    }

    async fn fetch_from(
        connector: TlsConnector,
        ip: IpAddr,
        port: u16,
    ) -> Result<CertBundle, CacheError> {
        let peer = (ip, port);
        tokio::time::timeout(FETCH_TIMEOUT, async move {
            let tcp = TcpStream::connect(peer).await?;
            let server_name = ServerName::try_from(MTLS_DOMAIN)
                .expect("mTLS domain is a valid server name")
                .to_owned();
            let mut stream = connector.connect(server_name, tcp).await?;
            let mut pem = Vec::new();
            stream.read_to_end(&mut pem).await?;
            Ok(CertBundle::from_pem(&pem)?)
        })
        .await
        .map_err(|_| {
            CacheError::Fanout(format!("peer {}:{} timed out", ip, port))
        })?
    }
}

#[async_trait]
impl Cache for TlsCache {
    async fn get(&self) -> Result<Option<CertBundle>, CacheError> {
        let ips = self
            .ips
            .ips(&self.domain)
            .await
            .map_err(|e| CacheError::Discovery(e.to_string()))?;
        trace!(domain = %self.domain, peers = ips.len(), "fetching certificate from peers");

        let tasks: Vec<_> = ips
            .iter()
            .map(|&ip| Self::fetch_from(self.connector.clone(), ip, self.port))
            .collect();
        let (bundles, errors) = race_all(tasks).await;

        if bundles.is_empty() {
            if errors.is_empty() {
                return Ok(None);
            }
            return Err(CacheError::Fanout(join_errors(&errors)));
        }
        if !errors.is_empty() {
            debug!(
                failed = errors.len(),
                succeeded = bundles.len(),
                "some peer fetches failed"
            );
        }
        Ok(CertBundle::latest(bundles))
    }

    async fn put(&self, _bundle: &CertBundle) -> Result<(), CacheError> {
        // Peers publish by serving; nothing to push.
        Ok(())
    }
}
