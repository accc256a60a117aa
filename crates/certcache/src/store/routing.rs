//! Composite store splitting local-only keys from shared ones

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::{is_local_only, BackingStore, StoreError};

/// Routes local-only keys to one store and every other key to another
///
/// The usual setup keeps ACME challenge tokens and the account key in a
/// [`DirStore`](super::DirStore) while certificates go to a shared
/// [`SecretManagerStore`](super::SecretManagerStore).
#[derive(Clone)]
pub struct RoutingStore {
    local: Arc<dyn BackingStore>,
    shared: Arc<dyn BackingStore>,
}

impl RoutingStore {
    pub fn new(local: Arc<dyn BackingStore>, shared: Arc<dyn BackingStore>) -> Self {
        Self { local, shared }
    }

    fn route(&self, key: &str) -> &dyn BackingStore {
        if is_local_only(key) {
            trace!(key = %key, "Routing key to local store");
            self.local.as_ref()
        } else {
            trace!(key = %key, "Routing key to shared store");
            self.shared.as_ref()
        }
    }
}

impl fmt::Debug for RoutingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl BackingStore for RoutingStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.route(key).get(key).await
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.route(key).put(key, data).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.route(key).delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryStore>, RoutingStore) {
        let local = Arc::new(MemoryStore::new());
        let shared = Arc::new(MemoryStore::new());
        let store = RoutingStore::new(local.clone(), shared.clone());
        (local, shared, store)
    }

    #[tokio::test]
    async fn test_local_only_keys_stay_local() {
        let (local, shared, store) = setup();

        for key in ["tok+token", "example.com+rsa", "x-http-01", "acme_account+key"] {
            store.put(key, b"v").await.unwrap();
            assert_eq!(store.get(key).await.unwrap(), b"v");
            assert!(local.contains(key));
            assert!(!shared.contains(key));
        }
    }

    #[tokio::test]
    async fn test_hostnames_go_to_shared() {
        let (local, shared, store) = setup();

        store.put("example.com", b"pem").await.unwrap();
        assert!(shared.contains("example.com"));
        assert!(!local.contains("example.com"));

        store.delete("example.com").await.unwrap();
        assert!(!shared.contains("example.com"));
    }
}
