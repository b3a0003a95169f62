//! Crate-level error types

use thiserror::Error;

use crate::acme::AcmeError;
use crate::cache::CacheError;
use crate::glue::GlueError;
use crate::pki::PkiError;

/// Errors surfaced by [`Manager`](crate::Manager) operations.
///
/// `Config` and `Pki` can only occur during one-time initialization and are
/// fatal; everything else is retryable on the next refresh tick.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing configuration supplied by the embedding
    /// application.
    #[error("configuration error: {0}")]
    Config(String),

    /// Certificate derivation or parsing failed.
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// The layered cache failed on every backend.
    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    /// The ACME order failed. The in-memory certificate is left untouched.
    #[error("acme: {0}")]
    Acme(#[from] AcmeError),

    /// Glue resolution failed.
    #[error("glue: {0}")]
    Glue(#[from] GlueError),

    /// Listener or socket setup failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Join a list of errors into one message, Go `errors.Join` style.
///
/// Callers guarantee `errs` is non-empty.
pub(crate) fn join_errors(errs: &[impl std::fmt::Display]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
