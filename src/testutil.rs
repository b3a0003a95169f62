//! Shared helpers for unit tests.

use crate::pki::{CertBundle, MasterKey};

/// Deterministic master key from a one-byte seed. Seeds below 0xf0 keep the
/// scalar inside the P-256 group order.
pub(crate) fn master_key(seed: u8) -> MasterKey {
    assert!(seed > 0 && seed < 0xf0);
    let secret = p256::SecretKey::from_slice(&[seed; 32]).unwrap();
    MasterKey::from_secret(secret)
}

/// Self-signed throwaway bundle whose leaf expires the given number of days
/// from now.
pub(crate) fn bundle_expiring_in_days(days: i64) -> CertBundle {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec!["bundle.test".to_string()]).unwrap();
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::days(days);
    let cert = params.self_signed(&key_pair).unwrap();
    let pem = format!("{}{}", cert.pem(), key_pair.serialize_pem());
    CertBundle::from_pem(pem.as_bytes()).unwrap()
}
