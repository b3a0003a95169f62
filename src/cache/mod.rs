//! Certificate caches
//!
//! A cache is anywhere a node can find the cluster's current public
//! certificate without running an ACME order: the local PEM file, or any
//! peer reachable over mTLS. Backends compose through [`LayeredCache`],
//! which merges results and returns the freshest certificate seen.
//!
//! Absence is not an error: `get` returns `Ok(None)` when a backend simply
//! has nothing, and reserves `Err` for backends that failed to answer.

use async_trait::async_trait;
use thiserror::Error;

use crate::pki::{CertBundle, PkiError};

mod file;
mod layered;
mod tls;

pub use file::FileCache;
pub use layered::LayeredCache;
pub use tls::TlsCache;

/// Errors from cache backends
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored or fetched bytes did not parse into a certificate bundle
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// Peer discovery (glue resolution) failed before any fetch started
    #[error("peer discovery failed: {0}")]
    Discovery(String),

    /// Every peer fetch in a fan-out failed
    #[error("peer fetch failed: {0}")]
    Fanout(String),

    /// Every layer of a layered cache failed
    #[error("all cache layers failed: {0}")]
    AllLayers(String),
}

/// Certificate store capability.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch the backend's current certificate, if it has one.
    async fn get(&self) -> Result<Option<CertBundle>, CacheError>;

    /// Store a certificate. Backends without storage treat this as a no-op.
    async fn put(&self, bundle: &CertBundle) -> Result<(), CacheError>;
}
