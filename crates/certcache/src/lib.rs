//! certcache
//!
//! Serves per-hostname TLS certificates to a live listener from a pluggable
//! store, with an in-memory TTL cache in front and an ACME-aware caching
//! store behind.
//!
//! - **Serving**: [`CertServingCache`] verifies PEM blobs once per TTL window
//!   and hands rustls a ready [`CertifiedKey`](rustls::sign::CertifiedKey)
//! - **Accepting**: [`CertAcceptor`] resolves the certificate from the
//!   ClientHello SNI and completes the handshake
//! - **Storage**: [`BackingStore`] implementations for local directories,
//!   Secret Manager, and key-class routing
//! - **ACME caching**: [`CachingStore`] keeps challenge tokens and account
//!   keys in a lock-protected local directory
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use certcache::{CertAcceptor, CertServingCache, DirStore, ServingCacheConfig};
//!
//! let store = Arc::new(DirStore::new("/var/lib/certcache/certs")?);
//! let cache = Arc::new(CertServingCache::new(store, ServingCacheConfig::default())?);
//! let acceptor = CertAcceptor::new(cache);
//!
//! let (tcp, _) = listener.accept().await?;
//! let tls = acceptor.accept(tcp).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acceptor;
pub mod caching;
pub mod config;
pub mod serving;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Storage
pub use store::{
    BackingStore, DirStore, MemoryStore, RoutingStore, SecretManagerStore, StaticToken,
    StoreError, TokenSource,
};

// ACME caching
pub use caching::{CachingStore, CachingStoreConfig};

// Serving
pub use serving::{
    CertError, CertServingCache, Clock, LeafInfo, ServedCertificate, ServingCacheConfig,
    ServingCacheStats, DEFAULT_TTL,
};

// TLS accept path
pub use acceptor::{AcceptError, CertAcceptor};

// Configuration
pub use config::{Config, ConfigError};
