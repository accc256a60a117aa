//! Store error types

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Boxed error used for causes that come from outside this crate
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by every [`BackingStore`](super::BackingStore) implementation
///
/// `CacheMiss` is the one kind callers routinely branch on: it means the key
/// has no stored value in any tier. Everything else is a real failure.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cache miss")]
    CacheMiss,

    #[error("store is readonly")]
    Readonly,

    #[error("failed to acquire cache lock {}: {source}", path.display())]
    LockFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("local {op} of {key:?} failed: {source}")]
    LocalOperation {
        op: &'static str,
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("backing {op} of {key:?} failed: {source}")]
    BackingOperation {
        op: &'static str,
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("{op} is not supported by the {store} store")]
    Unsupported {
        op: &'static str,
        store: &'static str,
    },
}

impl StoreError {
    /// Wrap a local filesystem error, folding "not found" into [`StoreError::CacheMiss`]
    pub(crate) fn local(op: &'static str, key: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            return Self::CacheMiss;
        }
        Self::LocalOperation {
            op,
            key: key.to_string(),
            source,
        }
    }

    /// Wrap an error from a remote backend
    pub(crate) fn backing(op: &'static str, key: &str, source: impl Into<BoxError>) -> Self {
        Self::BackingOperation {
            op,
            key: key.to_string(),
            source: source.into(),
        }
    }

    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::CacheMiss)
    }

    pub fn is_readonly(&self) -> bool {
        matches!(self, Self::Readonly)
    }

    pub fn is_lock_failed(&self) -> bool {
        matches!(self, Self::LockFailed { .. })
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_becomes_cache_miss() {
        let err = StoreError::local("get", "example.com", io::ErrorKind::NotFound.into());
        assert!(err.is_cache_miss());
    }

    #[test]
    fn test_local_error_keeps_cause() {
        let err = StoreError::local(
            "put",
            "example.com",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_cache_miss());
        let msg = err.to_string();
        assert!(msg.contains("put"));
        assert!(msg.contains("example.com"));
        assert!(msg.contains("denied"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_backing_error_wraps_store_error() {
        let err = StoreError::backing("delete", "example.com", StoreError::Unsupported {
            op: "delete",
            store: "secret manager",
        });
        let source = std::error::Error::source(&err).unwrap();
        let inner = source.downcast_ref::<StoreError>().unwrap();
        assert!(inner.is_unsupported());
    }
}
