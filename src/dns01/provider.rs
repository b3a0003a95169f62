//! In-memory challenge store

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{challenge_fqdn, challenge_value, normalize_fqdn, ChallengeError, Challenger};

/// Holds the TXT values of in-flight ACME orders on this node.
///
/// The issuer calls [`present`](Self::present) before asking the CA to
/// validate and [`cleanup`](Self::cleanup) afterwards; in between, the DNS
/// server exposes the values to anyone who asks for the
/// `_local_acme-challenge` name. Entries live only as long as one order.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    challenges: RwLock<HashMap<String, Vec<String>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the challenge value for a domain's order.
    pub fn present(&self, domain: &str, key_authorization: &str) {
        let fqdn = challenge_fqdn(domain);
        let value = challenge_value(key_authorization);
        debug!(fqdn = %fqdn, "publishing DNS-01 challenge value");
        self.challenges.write().entry(fqdn).or_default().push(value);
    }

    /// Withdraw one occurrence of the challenge value; drops the name once
    /// no values remain.
    pub fn cleanup(&self, domain: &str, key_authorization: &str) {
        let fqdn = challenge_fqdn(domain);
        let value = challenge_value(key_authorization);
        let mut challenges = self.challenges.write();
        if let Some(values) = challenges.get_mut(&fqdn) {
            if let Some(pos) = values.iter().position(|v| v == &value) {
                values.remove(pos);
            }
            if values.is_empty() {
                challenges.remove(&fqdn);
            }
        }
        debug!(fqdn = %challenge_fqdn(domain), "withdrew DNS-01 challenge value");
    }
}

#[async_trait]
impl Challenger for MemoryProvider {
    async fn challenge(&self, fqdn: &str) -> Result<Vec<String>, ChallengeError> {
        let key = normalize_fqdn(fqdn);
        Ok(self
            .challenges
            .read()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }
}
