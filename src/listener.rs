//! TLS accept loop with peer certificate sharing
//!
//! Wraps a TCP listener and finishes the TLS handshake before surfacing
//! connections. The ClientHello picks the configuration: SNI "zerocert"
//! gets the mTLS config (peer leaf, client certs required against the
//! derived CA); everything else gets the serving config with the ACME
//! certificate.
//!
//! Connections that negotiated both SNI and ALPN "zerocert" are cluster
//! peers asking for the current certificate. They receive the PEM bundle
//! and are closed without ever reaching [`TlsListener::accept`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

use crate::manager::CertSlot;
use crate::pki::{validate_peer_cert, PkiError, MTLS_DOMAIN};

/// Handshake deadline per connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type AcceptResult = io::Result<(TlsStream<TcpStream>, SocketAddr)>;

/// TLS listener that hides intra-cluster certificate-share connections.
pub struct TlsListener {
    conns: Mutex<mpsc::Receiver<AcceptResult>>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TlsListener {
    pub(crate) fn new(
        listener: TcpListener,
        mtls_config: Arc<ServerConfig>,
        serve_config: Arc<ServerConfig>,
        ca: CertificateDer<'static>,
        slot: Arc<CertSlot>,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(1);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            mtls_config,
            serve_config,
            ca,
            slot,
            tx,
        ));
        Ok(Self {
            conns: Mutex::new(rx),
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next application connection, TLS handshake already complete.
    ///
    /// Peer cert-share connections are consumed internally; handshake
    /// failures are logged and skipped rather than surfaced, so a
    /// misbehaving client cannot wedge the accept loop.
    pub async fn accept(&self) -> AcceptResult {
        let mut conns = self.conns.lock().await;
        match conns.recv().await {
            Some(result) => result,
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "listener closed",
            )),
        }
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    mtls_config: Arc<ServerConfig>,
    serve_config: Arc<ServerConfig>,
    ca: CertificateDer<'static>,
    slot: Arc<CertSlot>,
    tx: mpsc::Sender<AcceptResult>,
) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        let mtls_config = mtls_config.clone();
        let serve_config = serve_config.clone();
        let ca = ca.clone();
        let slot = slot.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            handle_conn(tcp, peer, mtls_config, serve_config, ca, slot, tx).await;
        });
    }
}

async fn handle_conn(
    tcp: TcpStream,
    peer: SocketAddr,
    mtls_config: Arc<ServerConfig>,
    serve_config: Arc<ServerConfig>,
    ca: CertificateDer<'static>,
    slot: Arc<CertSlot>,
    tx: mpsc::Sender<AcceptResult>,
) {
    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), tcp).await?;
        let is_peer_sni = start
            .client_hello()
            .server_name()
            .is_some_and(|name| name == MTLS_DOMAIN);
        let config = if is_peer_sni {
            mtls_config
        } else {
            serve_config
        };
        start.into_stream(config).await
    })
    .await;

    let stream = match handshake {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "tls handshake failed");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "tls handshake timed out");
            return;
        }
    };

    let (_, conn) = stream.get_ref();
    let is_peer = conn.server_name() == Some(MTLS_DOMAIN)
        && conn.alpn_protocol() == Some(MTLS_DOMAIN.as_bytes());
    if is_peer {
        serve_certificate(stream, peer, &ca, &slot).await;
        return;
    }

    let _ = tx.send(Ok((stream, peer))).await;
}

/// Write the current certificate bundle to an authenticated peer.
async fn serve_certificate(
    mut stream: TlsStream<TcpStream>,
    peer: SocketAddr,
    ca: &CertificateDer<'static>,
    slot: &CertSlot,
) {
    let peer_cert = {
        let (_, conn) = stream.get_ref();
        conn.peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.clone().into_owned())
    };
    let validated = match &peer_cert {
        Some(cert) => validate_peer_cert(cert, ca),
        None => Err(PkiError::NoPeerCertificate),
    };
    if let Err(e) = validated {
        warn!(peer = %peer, error = %e, "cert request: client auth failed");
        return;
    }

    let Some(bundle) = slot.bundle() else {
        warn!(peer = %peer, "cert request: no certificate to share");
        return;
    };

    debug!(peer = %peer, not_after = %bundle.not_after(), "sharing certificate with peer");
    if let Err(e) = stream.write_all(&bundle.to_pem()).await {
        warn!(peer = %peer, error = %e, "cert request: write failed");
    }
    let _ = stream.shutdown().await;
}
