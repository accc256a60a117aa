//! Certificate lookup error types

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Errors from [`CertServingCache`](super::CertServingCache)
///
/// Every variant is terminal for the lookup that produced it; the cache
/// never retries and never stores a partially validated entry.
#[derive(Error, Debug)]
pub enum CertError {
    #[error("missing server name")]
    MissingServerName,

    #[error("server name component count invalid: {0:?}")]
    InvalidComponentCount(String),

    #[error("server name contains invalid character: {0:?}")]
    InvalidCharacter(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("timed out after {timeout:?} fetching certificate for {name}")]
    FetchTimeout { name: String, timeout: Duration },

    #[error("no private key for {0}")]
    NoPrivateKey(String),

    #[error("failed to parse private key for {0}")]
    PrivateKey(String),

    #[error("failed to parse private key for {name}: unsupported {algorithm} key in PKCS#8 wrapping")]
    UnsupportedKeyType { name: String, algorithm: String },

    #[error("no public key/certs found for {0}")]
    NoCertificates(String),

    #[error("corrupt/spurious certs for {0}")]
    CorruptCertificates(String),

    #[error("private key does not match public key for {0}")]
    KeyMismatch(String),

    #[error("invalid leaf cert {name}: {source}")]
    InvalidLeaf {
        name: String,
        #[source]
        source: rustls::Error,
    },

    #[error("invalid root certificate set: {0}")]
    Roots(#[from] rustls::client::VerifierBuilderError),
}

impl CertError {
    /// Whether the store had nothing for the requested name
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_cache_miss())
    }

    /// Whether the request itself named an unusable host
    pub fn is_invalid_server_name(&self) -> bool {
        matches!(
            self,
            Self::MissingServerName | Self::InvalidComponentCount(_) | Self::InvalidCharacter(_)
        )
    }

    /// Whether stored material was fetched but failed parsing or verification
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            Self::NoPrivateKey(_)
                | Self::PrivateKey(_)
                | Self::UnsupportedKeyType { .. }
                | Self::NoCertificates(_)
                | Self::CorruptCertificates(_)
                | Self::InvalidLeaf { .. }
                | Self::KeyMismatch(_)
        )
    }
}
