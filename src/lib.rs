//! zerocert: coordinator-free wildcard TLS for clusters
//!
//! Every node of a cluster serving the same wildcard domain runs this
//! library with the same configuration, including one shared EC P-256
//! master key. From that single secret each node derives the same private
//! CA and peer certificates, so nodes authenticate each other over mTLS
//! with nothing provisioned out of band.
//!
//! # Components
//!
//! - [`Manager`] - init, refresh state machine, and the wiring between all
//!   of the below
//! - [`pki`] - deterministic CA and peer leaf derivation from the master key
//! - [`cache`] - layered certificate cache: mTLS peer fetch over the file
//!   cache, freshest certificate wins
//! - [`glue`] - iterative resolver for the domain's authoritative NS set,
//!   bypassing recursors that would loop back into the cluster
//! - [`dns01`] - in-memory challenge store, cluster-wide challenge lookup,
//!   and the DNS server answering the ACME CA's TXT queries
//! - [`acme`] - DNS-01 order flow on top of `instant-acme`
//!
//! # Steady state
//!
//! [`Manager::load_or_refresh`] returns immediately while the in-memory
//! certificate has more than 30 days of validity left. Once it goes stale,
//! the node races its local file against every reachable peer and adopts
//! the freshest result. Only when nobody has anything fresher does it run
//! an ACME order; the DNS-01 TXT record is answered by whichever cluster
//! node the CA happens to ask, because every node can pull the challenge
//! from the ordering node's memory provider.
//!
//! # Example
//!
//! ```ignore
//! use zerocert::{Config, Manager};
//!
//! let manager = std::sync::Arc::new(Manager::new(Config {
//!     email: "ops@example.com".into(),
//!     reg: "https://acme-v02.api.letsencrypt.org/acme/acct/123".into(),
//!     key: std::fs::read("/etc/zerocert/master.pem")?,
//!     domain: "example.com".into(),
//!     cache_file: "/var/lib/zerocert/cert.pem".into(),
//!     directory_url: None,
//!     base_tls: None,
//!     peer_source: None,
//! }));
//!
//! let tls = manager.tls_listener(tokio::net::TcpListener::bind("0.0.0.0:443").await?).await?;
//! let dns = manager.dns_listener(tokio::net::UdpSocket::bind("0.0.0.0:53").await?).await?;
//!
//! manager.load_or_refresh().await?;
//! loop {
//!     let (conn, peer) = tls.accept().await?;
//!     // serve conn
//! }
//! ```

pub mod acme;
pub mod cache;
pub mod dns01;
pub mod glue;
pub mod pki;

mod error;
mod fanout;
mod listener;
mod manager;

#[cfg(test)]
mod testutil;

pub use error::Error;
pub use listener::TlsListener;
pub use manager::{Config, Manager};
pub use pki::{CertBundle, MTLS_DOMAIN};
