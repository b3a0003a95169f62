//! Shared fixtures for integration tests.

use std::net::IpAddr;
use std::sync::{Arc, Once};

use async_trait::async_trait;
use zerocert::glue::{GlueError, IpSource};
use zerocert::pki::CertBundle;

/// Install the tracing subscriber once per test binary; honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// PEM for a P-256 master key built from a fixed scalar, so every "node"
/// in a test derives the same PKI.
pub fn master_key_pem(seed: u8) -> Vec<u8> {
    let secret = p256::SecretKey::from_slice(&[seed; 32]).unwrap();
    p256::pkcs8::EncodePrivateKey::to_pkcs8_pem(&secret, p256::pkcs8::LineEnding::LF)
        .unwrap()
        .as_bytes()
        .to_vec()
}

/// Fixed peer set, standing in for glue resolution.
pub struct StaticPeers(pub Vec<IpAddr>);

#[async_trait]
impl IpSource for StaticPeers {
    async fn ips(&self, _fqdn: &str) -> Result<Vec<IpAddr>, GlueError> {
        Ok(self.0.clone())
    }
}

pub fn static_peers(ips: &[&str]) -> Arc<StaticPeers> {
    Arc::new(StaticPeers(
        ips.iter().map(|ip| ip.parse().unwrap()).collect(),
    ))
}

/// Self-signed bundle for `*.cluster.test` expiring `days` from now.
pub fn wildcard_bundle(days: i64) -> CertBundle {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec![
        "*.cluster.test".to_string(),
        "cluster.test".to_string(),
    ])
    .unwrap();
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::days(days);
    let cert = params.self_signed(&key_pair).unwrap();
    let pem = format!("{}{}", cert.pem(), key_pair.serialize_pem());
    CertBundle::from_pem(pem.as_bytes()).unwrap()
}
