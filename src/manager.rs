//! Certificate manager and refresh state machine
//!
//! One [`Manager`] per node. [`Manager::load_or_refresh`] is idempotent and
//! safe to call on a schedule: it initializes once, returns immediately
//! while the in-memory certificate is fresh, then tries the caches (local
//! file, any reachable peer) before falling back to a full ACME order.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::acme::{AcmeIssuer, LETSENCRYPT_PRODUCTION};
use crate::cache::{Cache, FileCache, LayeredCache, TlsCache};
use crate::dns01::{DnsListener, DnsServer, MemoryProvider, PeerChallenger};
use crate::error::Error;
use crate::glue::{GlueResolver, IpSource};
use crate::listener::TlsListener;
use crate::pki::{
    derive_ca, derive_leaf, CertBundle, LeafRole, MasterKey, PkiError, MTLS_DOMAIN,
};

/// Refresh when less than this much validity remains.
const REFRESH_WINDOW_DAYS: i64 = 30;

/// Node configuration, supplied by the embedding application.
#[derive(Clone)]
pub struct Config {
    /// ACME account email; used only when `reg` is empty and a new account
    /// has to be created.
    pub email: String,
    /// ACME account registration URI. The account is reconstructed from
    /// this URI plus the master key, so no ACME state is stored on disk.
    pub reg: String,
    /// PEM-encoded EC P-256 master key shared by every node.
    pub key: Vec<u8>,
    /// Base domain D; the issued certificate covers `*.D` and `D`.
    pub domain: String,
    /// Path of the local certificate cache file.
    pub cache_file: PathBuf,
    /// ACME directory URL; defaults to Let's Encrypt production.
    pub directory_url: Option<String>,
    /// Base TLS configuration for non-peer connections. Cloned, with the
    /// certificate resolver replaced by the managed certificate.
    pub base_tls: Option<Arc<ServerConfig>>,
    /// Peer discovery override. Defaults to the iterative glue resolver;
    /// set this when the peer set is static or resolved by other means.
    pub peer_source: Option<Arc<dyn IpSource>>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("email", &self.email)
            .field("domain", &self.domain)
            .field("cache_file", &self.cache_file)
            .finish_non_exhaustive()
    }
}

pub(crate) struct CurrentCert {
    bundle: Arc<CertBundle>,
    certified: Arc<CertifiedKey>,
}

/// Shared slot holding the node's current public certificate.
///
/// Readers are the TLS hot path; writers are the rare refresh events.
#[derive(Default)]
pub(crate) struct CertSlot(RwLock<Option<CurrentCert>>);

impl CertSlot {
    pub(crate) fn bundle(&self) -> Option<Arc<CertBundle>> {
        self.0.read().as_ref().map(|c| c.bundle.clone())
    }

    fn certified(&self) -> Option<Arc<CertifiedKey>> {
        self.0.read().as_ref().map(|c| c.certified.clone())
    }
}

impl std::fmt::Debug for CertSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertSlot")
            .field("populated", &self.0.read().is_some())
            .finish()
    }
}

/// Serves the managed certificate to rustls.
#[derive(Debug)]
struct ManagedCertResolver {
    slot: Arc<CertSlot>,
}

impl ResolvesServerCert for ManagedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.slot.certified()
    }
}

struct Inner {
    ca_der: CertificateDer<'static>,
    client_config: Arc<ClientConfig>,
    mtls_config: Arc<ServerConfig>,
    serve_config: Arc<ServerConfig>,
    peers: Arc<dyn IpSource>,
    dns_server: Arc<DnsServer>,
    issuer: AcmeIssuer,
}

/// Cluster certificate manager.
pub struct Manager {
    config: Config,
    inner: OnceCell<Inner>,
    slot: Arc<CertSlot>,
    cache: RwLock<Option<Arc<LayeredCache>>>,
}

impl Manager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            inner: OnceCell::new(),
            slot: Arc::new(CertSlot::default()),
            cache: RwLock::new(None),
        }
    }

    async fn inner(&self) -> Result<&Inner, Error> {
        self.inner.get_or_try_init(|| async { self.init() }).await
    }

    /// One-time derivation of the PKI and assembly of the TLS configs, the
    /// DNS server, and the ACME issuer. Failures here are fatal.
    fn init(&self) -> Result<Inner, Error> {
        if self.config.domain.is_empty() {
            return Err(Error::Config("domain is required".to_string()));
        }

        let master = MasterKey::from_pem(&self.config.key)
            .map_err(|e| Error::Config(format!("loading master key: {e}")))?;
        let ca = derive_ca(&master)?;
        let server_leaf = derive_leaf(&ca, &master, MTLS_DOMAIN, LeafRole::Server)?;
        let client_leaf = derive_leaf(&ca, &master, MTLS_DOMAIN, LeafRole::Client)?;
        let master_key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(master.to_pkcs8_der()?));

        let mut roots = RootCertStore::empty();
        roots
            .add(ca.der().clone())
            .map_err(|e| PkiError::CertificateParse(e.to_string()))?;

        let _ = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::aws_lc_rs::default_provider(),
        );

        let mut client_config = ClientConfig::builder()
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(vec![client_leaf], master_key_der.clone_key())
            .map_err(|e| PkiError::CertificateCreation(e.to_string()))?;
        client_config.alpn_protocols = vec![MTLS_DOMAIN.as_bytes().to_vec()];

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| PkiError::CertificateCreation(format!("client verifier: {e}")))?;
        let mut mtls_config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![server_leaf], master_key_der)
            .map_err(|e| PkiError::CertificateCreation(e.to_string()))?;
        mtls_config.alpn_protocols = vec![MTLS_DOMAIN.as_bytes().to_vec()];

        let resolver = Arc::new(ManagedCertResolver {
            slot: self.slot.clone(),
        });
        let mut serve_config = match &self.config.base_tls {
            Some(base) => (**base).clone(),
            None => ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(resolver.clone()),
        };
        serve_config.cert_resolver = resolver;

        let peers: Arc<dyn IpSource> = self
            .config
            .peer_source
            .clone()
            .unwrap_or_else(|| Arc::new(GlueResolver::new()));
        let provider = Arc::new(MemoryProvider::new());
        let distributed = Arc::new(PeerChallenger::new(peers.clone()));
        let dns_server = Arc::new(
            DnsServer::new(&self.config.domain, distributed.clone(), provider.clone())
                .map_err(|e| Error::Config(e.to_string()))?,
        );

        let issuer = AcmeIssuer::new(
            self.config.email.clone(),
            self.config.reg.clone(),
            self.config
                .directory_url
                .clone()
                .unwrap_or_else(|| LETSENCRYPT_PRODUCTION.to_string()),
            master.to_pkcs8_der()?,
            provider,
            Some(distributed),
        );

        info!(domain = %self.config.domain, "certificate manager initialized");
        Ok(Inner {
            ca_der: ca.der().clone(),
            client_config: Arc::new(client_config),
            mtls_config: Arc::new(mtls_config),
            serve_config: Arc::new(serve_config),
            peers,
            dns_server,
            issuer,
        })
    }

    /// Bring the in-memory certificate up to date.
    ///
    /// Fresh certificate: no-op. Stale: adopt the freshest bundle any cache
    /// layer offers. Still stale: run an ACME order and write the result
    /// back through every cache layer. A failed order never touches the
    /// certificate currently being served.
    pub async fn load_or_refresh(&self) -> Result<(), Error> {
        let inner = self.inner().await?;

        if !self.needs_refresh() {
            return Ok(());
        }

        self.load_cache().await;
        if !self.needs_refresh() {
            return Ok(());
        }

        let domains = vec![
            format!("*.{}", self.config.domain),
            self.config.domain.clone(),
        ];
        let bundle = inner.issuer.obtain(&domains).await?;
        self.install_if_newer(bundle)?;
        self.save_cache().await?;
        Ok(())
    }

    /// The certificate currently being served, if any.
    pub fn certificate(&self) -> Option<Arc<CertBundle>> {
        self.slot.bundle()
    }

    /// Wrap a TCP listener for serving on port 443.
    ///
    /// Also assembles the layered cache: peers are dialed on the same port
    /// this listener is bound to, with the local file as the second layer.
    pub async fn tls_listener(&self, listener: TcpListener) -> Result<TlsListener, Error> {
        let inner = self.inner().await?;
        let port = listener.local_addr()?.port();

        let tls_cache = TlsCache::new(
            self.config.domain.clone(),
            port,
            inner.peers.clone(),
            inner.client_config.clone(),
        );
        let file_cache = FileCache::new(self.config.cache_file.clone());
        let layered = LayeredCache::new(vec![Box::new(tls_cache), Box::new(file_cache)]);
        *self.cache.write() = Some(Arc::new(layered));

        Ok(TlsListener::new(
            listener,
            inner.mtls_config.clone(),
            inner.serve_config.clone(),
            inner.ca_der.clone(),
            self.slot.clone(),
        )?)
    }

    /// Wrap a UDP socket as the DNS-01 challenge authority on port 53.
    pub async fn dns_listener(&self, socket: UdpSocket) -> Result<DnsListener, Error> {
        let inner = self.inner().await?;
        Ok(DnsListener::new(socket, inner.dns_server.clone()))
    }

    fn needs_refresh(&self) -> bool {
        match self.slot.bundle() {
            None => true,
            Some(bundle) => {
                bundle.not_after() - Utc::now() < chrono::Duration::days(REFRESH_WINDOW_DAYS)
            }
        }
    }

    /// Adopt a bundle unless the incumbent is at least as fresh; the served
    /// certificate is never downgraded.
    fn install_if_newer(&self, bundle: CertBundle) -> Result<bool, Error> {
        let certified = Arc::new(bundle.certified_key()?);
        let mut slot = self.slot.0.write();
        if let Some(current) = slot.as_ref() {
            if current.bundle.not_after() >= bundle.not_after() {
                debug!(
                    current = %current.bundle.not_after(),
                    offered = %bundle.not_after(),
                    "keeping incumbent certificate"
                );
                return Ok(false);
            }
        }
        info!(not_after = %bundle.not_after(), "adopting certificate");
        *slot = Some(CurrentCert {
            bundle: Arc::new(bundle),
            certified,
        });
        Ok(true)
    }

    async fn load_cache(&self) {
        let cache = self.cache.read().clone();
        let Some(cache) = cache else {
            return;
        };
        match cache.get().await {
            Ok(Some(bundle)) => {
                if let Err(e) = self.install_if_newer(bundle) {
                    warn!(error = %e, "cached certificate unusable");
                }
            }
            Ok(None) => debug!("no cached certificate available"),
            // Unreachable caches must not stop the node from running its
            // own ACME order.
            Err(e) => warn!(error = %e, "cache load failed"),
        }
    }

    async fn save_cache(&self) -> Result<(), Error> {
        let cache = self.cache.read().clone();
        let (Some(cache), Some(bundle)) = (cache, self.slot.bundle()) else {
            return Ok(());
        };
        cache.put(&bundle).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("initialized", &self.inner.initialized())
            .finish()
    }
}
