//! DNS-01 challenge machinery
//!
//! The cluster answers the public CA's DNS-01 TXT queries itself instead of
//! driving a hosted DNS provider's API. Two names cooperate:
//!
//! - `_acme-challenge.<domain>`: what the CA resolves. Any node receiving
//!   this query fans out to *all* cluster peers, so the node that is
//!   actually mid-order does not need to be the one the CA happens to ask.
//! - `_local_acme-challenge.<domain>`: the internal name nodes use when
//!   polling each other. It is answered from the node's own in-memory
//!   challenge map only, which breaks the recursion.
//!
//! [`MemoryProvider`] holds the TXT values an in-flight order has placed,
//! [`PeerChallenger`] performs the cluster-wide pull, and [`DnsServer`]
//! stitches both into the wire protocol.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::glue::GlueError;

mod challenger;
mod provider;
mod server;

pub use challenger::PeerChallenger;
pub use provider::MemoryProvider;
pub use server::{DnsListener, DnsServer, PendingAnswer};

/// Name prefix the public ACME CA queries.
pub const ACME_CHALLENGE_PREFIX: &str = "_acme-challenge.";

/// Name prefix cluster nodes use to poll each other's local values.
pub const LOCAL_CHALLENGE_PREFIX: &str = "_local_acme-challenge.";

/// Errors from challenge lookups
#[derive(Debug, Error)]
pub enum ChallengeError {
    /// Every peer query in a fan-out failed
    #[error("peer challenge queries failed: {0}")]
    Upstream(String),

    /// The challenge name could not be encoded as a DNS name
    #[error("invalid challenge name '{fqdn}': {message}")]
    InvalidName { fqdn: String, message: String },

    /// Resolving the authoritative peer set failed
    #[error(transparent)]
    Glue(#[from] GlueError),
}

/// Source of TXT values for a challenge name.
#[async_trait]
pub trait Challenger: Send + Sync {
    /// Current TXT values for `fqdn`. An empty list is a valid answer.
    async fn challenge(&self, fqdn: &str) -> Result<Vec<String>, ChallengeError>;
}

/// RFC 8555 §8.4: the TXT record value is the base64url-encoded SHA-256
/// digest of the key authorization.
pub fn challenge_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// The TXT record name for a domain's DNS-01 challenge, normalized to the
/// form used as a challenge-map key: lower-case, trailing dot, wildcard
/// label stripped.
pub fn challenge_fqdn(domain: &str) -> String {
    let base = domain.strip_prefix("*.").unwrap_or(domain);
    let mut fqdn = format!("{}{}", ACME_CHALLENGE_PREFIX, base.to_ascii_lowercase());
    if !fqdn.ends_with('.') {
        fqdn.push('.');
    }
    fqdn
}

/// Normalize an incoming query name to challenge-map key form.
pub(crate) fn normalize_fqdn(fqdn: &str) -> String {
    let mut name = fqdn.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_value_is_base64url() {
        let value = challenge_value(
            "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA.QxKhYaH6VWOWyLVV9dVRqY8hZVp-ZxCfmYkf8BwqF0c",
        );
        assert!(!value.is_empty());
        assert!(!value.contains('+'));
        assert!(!value.contains('/'));
        assert!(!value.contains('='));
    }

    #[test]
    fn challenge_fqdn_normalizes() {
        assert_eq!(
            challenge_fqdn("example.com"),
            "_acme-challenge.example.com."
        );
        assert_eq!(
            challenge_fqdn("*.example.com"),
            "_acme-challenge.example.com."
        );
        assert_eq!(
            challenge_fqdn("Sub.Example.COM."),
            "_acme-challenge.sub.example.com."
        );
    }
}
