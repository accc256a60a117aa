//! Backing stores for certificate material
//!
//! A backing store is a flat key/value map over raw bytes. Keys are either
//! DNS hostnames (the PEM blob for that host's certificate) or the auxiliary
//! names ACME tooling uses for challenge tokens and account keys.
//!
//! # Implementations
//!
//! - [`DirStore`] - one file per key in a local directory
//! - [`SecretManagerStore`] - secrets in a Secret Manager style REST service
//! - [`RoutingStore`] - sends local-only keys to one store, everything else to another
//! - [`MemoryStore`] - in-process map, handy for tests and preloaded certificates
//!
//! # Key Classes
//!
//! ```text
//! example.com               shared      certificate blob, goes to the backing store
//! example.com+rsa           local-only  RSA variant produced by ACME tooling
//! <token>+token             local-only  tls-alpn challenge token
//! <token>http-01            local-only  HTTP-01 challenge response
//! acme_account+key          local-only  ACME account private key
//! ```

mod dir;
mod error;
mod memory;
mod routing;
mod secret_manager;

use async_trait::async_trait;

pub(crate) use dir::{create_private_dir, read_key, remove_key, write_key};
pub use dir::DirStore;
pub use error::{BoxError, StoreError};
pub use memory::{MemoryStore, MemoryStoreStats};
pub use routing::RoutingStore;
pub use secret_manager::{
    SecretManagerStore, StaticToken, TokenSource, DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT,
};

/// Names ACME tooling uses for the account private key
pub const ACCOUNT_KEY_NAMES: [&str; 2] = ["acme_account+key", "acme_account.key"];

/// Key/value storage for certificate material
///
/// `get` must return [`StoreError::CacheMiss`] when the key has no value;
/// callers use that to decide between issuing a fresh certificate and
/// failing outright.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Fetch the bytes stored under `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Store `data` under `key`, replacing any previous value
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Remove `key`
    ///
    /// Stores that cannot delete return [`StoreError::Unsupported`].
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Whether `key` names the ACME account private key
pub fn is_account_key(key: &str) -> bool {
    ACCOUNT_KEY_NAMES.contains(&key)
}

/// Whether `key` must stay in the local cache directory
///
/// Challenge tokens, RSA key variants and the account key are only ever
/// useful to the process that created them.
pub fn is_local_only(key: &str) -> bool {
    key.ends_with("+token")
        || key.ends_with("+rsa")
        || key.contains("http-01")
        || is_account_key(key)
}
