//! ACME order flow
//!
//! Wraps `instant-acme` for the one thing the cluster needs: obtain a
//! wildcard certificate using DNS-01 challenges answered by the cluster's
//! own DNS servers. The account is the shared master key; no ACME state is
//! persisted because every node can rebuild the account from its
//! registration URI and the key.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::dns01::{challenge_fqdn, challenge_value, Challenger, MemoryProvider};
use crate::pki::{CertBundle, PkiError};

/// Let's Encrypt production directory URL, the default when the embedding
/// application does not override it.
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Deadline for the order to become ready after challenges are set ready.
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);
/// Deadline for certificate issuance after finalization.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for the cluster-visibility probe; purely advisory.
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for fetching the ACME directory when rebuilding credentials.
const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the ACME order flow
#[derive(Debug, Error)]
pub enum AcmeError {
    /// Could not construct or create the ACME account
    #[error("failed to construct ACME account: {0}")]
    Account(String),

    /// Order creation or refresh failed
    #[error("failed to create certificate order: {0}")]
    OrderCreation(String),

    /// A challenge could not be marked ready or the order never validated
    #[error("challenge validation failed: {0}")]
    ChallengeValidation(String),

    /// CSR submission or certificate retrieval failed
    #[error("failed to finalize certificate: {0}")]
    Finalization(String),

    /// No DNS-01 challenge offered for a domain
    #[error("no DNS-01 challenge available for '{0}'")]
    NoDns01Challenge(String),

    /// ACME protocol error from instant-acme
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// An ACME step exceeded its deadline
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The issued certificate did not parse
    #[error(transparent)]
    Pki(#[from] PkiError),
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}

/// Certificate issuer bound to the cluster's shared account key.
pub struct AcmeIssuer {
    email: String,
    reg: String,
    directory_url: String,
    key_pkcs8_der: Vec<u8>,
    provider: Arc<MemoryProvider>,
    visibility: Option<Arc<dyn Challenger>>,
    account: RwLock<Option<Account>>,
}

struct PendingChallenge {
    domain: String,
    key_authorization: String,
    url: String,
}

impl AcmeIssuer {
    /// `reg` is the account registration URI; when empty, a new account is
    /// created on first use with `email` as the contact. `provider` is
    /// where challenge values are published for the DNS servers to serve;
    /// `visibility`, when set, is polled before validation to confirm the
    /// values are observable cluster-wide.
    pub fn new(
        email: String,
        reg: String,
        directory_url: String,
        key_pkcs8_der: Vec<u8>,
        provider: Arc<MemoryProvider>,
        visibility: Option<Arc<dyn Challenger>>,
    ) -> Self {
        Self {
            email,
            reg,
            directory_url,
            key_pkcs8_der,
            provider,
            visibility,
            account: RwLock::new(None),
        }
    }

    /// Rebuild account credentials from the registration URI and the
    /// master key, in the JSON schema instant-acme itself serializes.
    ///
    /// That schema embeds the directory's endpoint URLs rather than the
    /// directory URL, so the directory document is fetched once here.
    async fn credentials(&self) -> Result<AccountCredentials, AcmeError> {
        let client = reqwest::Client::builder()
            .timeout(DIRECTORY_TIMEOUT)
            .build()
            .map_err(|e| AcmeError::Account(format!("failed to create HTTP client: {e}")))?;

        let response = client
            .get(&self.directory_url)
            .send()
            .await
            .map_err(|e| AcmeError::Account(format!("failed to fetch ACME directory: {e}")))?;
        if !response.status().is_success() {
            return Err(AcmeError::Account(format!(
                "failed to fetch ACME directory: HTTP {}",
                response.status()
            )));
        }
        let directory: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AcmeError::Account(format!("failed to parse ACME directory: {e}")))?;

        assemble_credentials(&self.reg, &self.key_pkcs8_der, &directory)
    }

    async fn ensure_account(&self) -> Result<(), AcmeError> {
        if self.account.read().await.is_some() {
            return Ok(());
        }

        let account = if self.reg.is_empty() {
            info!(email = %self.email, directory = %self.directory_url, "creating new ACME account");
            let (account, _credentials) = Account::builder()
                .map_err(|e| AcmeError::Account(e.to_string()))?
                .create(
                    &NewAccount {
                        contact: &[&format!("mailto:{}", self.email)],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    self.directory_url.clone(),
                    None,
                )
                .await
                .map_err(|e| AcmeError::Account(e.to_string()))?;
            account
        } else {
            debug!(reg = %self.reg, "loading ACME account from registration URI");
            let credentials = self.credentials().await?;
            Account::builder()
                .map_err(|e| AcmeError::Account(e.to_string()))?
                .from_credentials(credentials)
                .await
                .map_err(|e| AcmeError::Account(e.to_string()))?
        };

        *self.account.write().await = Some(account);
        Ok(())
    }

    /// Run a full DNS-01 order for `domains` and return the issued bundle.
    ///
    /// Challenge values are published to the memory provider for the
    /// duration of the order and withdrawn on every exit path. The
    /// in-memory certificate of the caller is never touched here; a failed
    /// order leaves the node serving whatever it served before.
    pub async fn obtain(&self, domains: &[String]) -> Result<CertBundle, AcmeError> {
        self.ensure_account().await?;
        let account_guard = self.account.read().await;
        let account = account_guard
            .as_ref()
            .expect("account initialized by ensure_account");

        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();
        info!(domains = ?domains, "creating certificate order");

        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::OrderCreation(e.to_string()))?;

        let challenges = self.collect_challenges(&mut order).await?;
        for challenge in &challenges {
            self.provider
                .present(&challenge.domain, &challenge.key_authorization);
        }

        let result = self
            .validate_and_finalize(&mut order, domains, &challenges)
            .await;

        // Withdraw the published values no matter how the order ended.
        for challenge in &challenges {
            self.provider
                .cleanup(&challenge.domain, &challenge.key_authorization);
        }

        result
    }

    /// Walk the order's authorizations and gather the DNS-01 challenge of
    /// every identifier that still needs validating.
    async fn collect_challenges(
        &self,
        order: &mut Order,
    ) -> Result<Vec<PendingChallenge>, AcmeError> {
        let mut challenges = Vec::new();
        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result
                .map_err(|e| AcmeError::OrderCreation(format!("failed to get authorization: {e}")))?;

            let identifier = authz.identifier();
            let domain = match &identifier.identifier {
                Identifier::Dns(domain) => domain.clone(),
                _ => continue,
            };
            debug!(domain = %domain, status = ?authz.status, "processing authorization");
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenge(ChallengeType::Dns01)
                .ok_or_else(|| AcmeError::NoDns01Challenge(domain.clone()))?;
            let key_authorization = challenge.key_authorization();

            challenges.push(PendingChallenge {
                domain,
                key_authorization: key_authorization.as_str().to_string(),
                url: challenge.url.clone(),
            });
        }
        Ok(challenges)
    }

    async fn validate_and_finalize(
        &self,
        order: &mut Order,
        domains: &[String],
        challenges: &[PendingChallenge],
    ) -> Result<CertBundle, AcmeError> {
        self.probe_visibility(challenges).await;

        for challenge in challenges {
            set_ready(order, &challenge.url).await?;
        }
        wait_for_order_ready(order).await?;

        finalize(order, domains).await
    }

    /// Confirm the published values are visible through the cluster's own
    /// lookup path before telling the CA to validate. Advisory only: the CA
    /// is the final arbiter, and a node with unreachable peers should still
    /// attempt the order.
    async fn probe_visibility(&self, challenges: &[PendingChallenge]) {
        let Some(checker) = &self.visibility else {
            return;
        };
        for challenge in challenges {
            let fqdn = format!("_local{}", challenge_fqdn(&challenge.domain));
            let expected = challenge_value(&challenge.key_authorization);
            match tokio::time::timeout(VISIBILITY_TIMEOUT, checker.challenge(&fqdn)).await {
                Ok(Ok(values)) if values.contains(&expected) => {
                    debug!(fqdn = %fqdn, "challenge value visible cluster-wide");
                }
                Ok(Ok(_)) => {
                    warn!(fqdn = %fqdn, "challenge value not yet visible on peers");
                }
                Ok(Err(e)) => {
                    warn!(fqdn = %fqdn, error = %e, "cluster visibility probe failed");
                }
                Err(_) => {
                    warn!(fqdn = %fqdn, "cluster visibility probe timed out");
                }
            }
        }
    }
}

impl std::fmt::Debug for AcmeIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeIssuer")
            .field("directory_url", &self.directory_url)
            .field("reg", &self.reg)
            .finish_non_exhaustive()
    }
}

/// Assemble `AccountCredentials` from the account URL, the account key,
/// and a fetched directory document.
///
/// The JSON mirrors what instant-acme serializes for its own credentials:
/// the account URL as `id`, the base64url PKCS#8 key, and the directory's
/// `newNonce`/`newAccount`/`newOrder` endpoints under `urls`.
fn assemble_credentials(
    reg: &str,
    key_pkcs8_der: &[u8],
    directory: &serde_json::Value,
) -> Result<AccountCredentials, AcmeError> {
    let endpoint = |name: &str| {
        directory
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                AcmeError::Account(format!("ACME directory has no '{name}' endpoint"))
            })
    };

    let key_b64 = URL_SAFE_NO_PAD.encode(key_pkcs8_der);
    serde_json::from_value(serde_json::json!({
        "id": reg,
        "key_pkcs8": key_b64,
        "urls": {
            "newNonce": endpoint("newNonce")?,
            "newAccount": endpoint("newAccount")?,
            "newOrder": endpoint("newOrder")?,
        },
    }))
    .map_err(|e| AcmeError::Account(format!("failed to assemble credentials: {e}")))
}

/// Find the challenge with the given URL and mark it ready for validation.
async fn set_ready(order: &mut Order, challenge_url: &str) -> Result<(), AcmeError> {
    let mut authorizations = order.authorizations();
    while let Some(result) = authorizations.next().await {
        let mut authz = result
            .map_err(|e| AcmeError::ChallengeValidation(format!("failed to get authorization: {e}")))?;

        let matching_type = authz
            .challenges
            .iter()
            .find(|c| c.url == challenge_url)
            .map(|c| c.r#type.clone());
        if let Some(challenge_type) = matching_type {
            if let Some(mut challenge) = authz.challenge(challenge_type) {
                challenge
                    .set_ready()
                    .await
                    .map_err(|e| AcmeError::ChallengeValidation(e.to_string()))?;
                return Ok(());
            }
        }
    }
    Err(AcmeError::ChallengeValidation(format!(
        "challenge not found for URL: {challenge_url}"
    )))
}

/// Poll the order until every challenge validated.
async fn wait_for_order_ready(order: &mut Order) -> Result<(), AcmeError> {
    let deadline = tokio::time::Instant::now() + CHALLENGE_TIMEOUT;
    loop {
        let state = order
            .refresh()
            .await
            .map_err(|e| AcmeError::OrderCreation(format!("failed to refresh order: {e}")))?;
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => {
                info!("order is ready for finalization");
                return Ok(());
            }
            OrderStatus::Invalid => {
                return Err(AcmeError::ChallengeValidation(
                    "order became invalid".to_string(),
                ));
            }
            OrderStatus::Pending | OrderStatus::Processing => {
                if tokio::time::Instant::now() > deadline {
                    return Err(AcmeError::Timeout(
                        "timed out waiting for order to become ready".to_string(),
                    ));
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Submit a CSR and retrieve the issued certificate as a bundle.
async fn finalize(order: &mut Order, domains: &[String]) -> Result<CertBundle, AcmeError> {
    info!("finalizing certificate order");

    let cert_key = rcgen::KeyPair::generate()
        .map_err(|e| AcmeError::Finalization(format!("failed to generate key: {e}")))?;
    let params = rcgen::CertificateParams::new(domains.to_vec())
        .map_err(|e| AcmeError::Finalization(format!("failed to create CSR params: {e}")))?;
    let csr_request = params
        .serialize_request(&cert_key)
        .map_err(|e| AcmeError::Finalization(format!("failed to serialize CSR: {e}")))?;
    let csr = csr_request.der().to_vec();

    order
        .finalize_csr(&csr)
        .await
        .map_err(|e| AcmeError::Finalization(format!("failed to finalize order: {e}")))?;

    let deadline = tokio::time::Instant::now() + FINALIZE_TIMEOUT;
    let cert_chain = loop {
        let state = order
            .refresh()
            .await
            .map_err(|e| AcmeError::Finalization(format!("failed to refresh order: {e}")))?;
        match state.status {
            OrderStatus::Valid => {
                let chain = order
                    .certificate()
                    .await
                    .map_err(|e| AcmeError::Finalization(format!("failed to get certificate: {e}")))?;
                break chain.ok_or_else(|| {
                    AcmeError::Finalization("no certificate in response".to_string())
                })?;
            }
            OrderStatus::Invalid => {
                return Err(AcmeError::Finalization("order became invalid".to_string()));
            }
            _ => {
                if tokio::time::Instant::now() > deadline {
                    return Err(AcmeError::Timeout(
                        "timed out waiting for certificate".to_string(),
                    ));
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    };

    let pem = format!("{}{}", cert_chain, cert_key.serialize_pem());
    let bundle = CertBundle::from_pem(pem.as_bytes())?;
    info!(not_after = %bundle.not_after(), "certificate issued");
    Ok(bundle)
}
