//! ACME-aware caching store
//!
//! Sits between ACME tooling and a [`BackingStore`]. Keys that only make
//! sense to this host (challenge tokens, RSA variants, the account key) are
//! kept in a local directory guarded by a file lock; certificates go straight
//! to the backing store.
//!
//! # Routing
//!
//! ```text
//! account key + account_key_name set  ->  backing store, under account_key_name
//! other local-only key                 ->  local directory, under the lock
//! anything else                        ->  backing store
//! ```
//!
//! Several processes may share one local directory, so the lock is a
//! `flock(2)` on a lock file rather than an in-process mutex. Readonly
//! instances read under a shared lock; writable ones always take the
//! exclusive lock.

mod lock;

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace};

use crate::store::{self, is_account_key, is_local_only, BackingStore, StoreError};

pub use lock::{DirLock, LockGuard, LOCK_FILE_NAME};

/// Options for a [`CachingStore`]
#[derive(Debug, Clone, Default)]
pub struct CachingStoreConfig {
    /// Local cache directory, created if missing
    pub dir: PathBuf,
    /// Reject every `put` and `delete`
    pub readonly: bool,
    /// Keep the ACME account key in the backing store under this name
    pub account_key_name: Option<String>,
}

impl CachingStoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn account_key_name(mut self, name: impl Into<String>) -> Self {
        self.account_key_name = Some(name.into());
        self
    }
}

enum Route<'a> {
    Local,
    Backing(Cow<'a, str>),
}

/// Local directory plus backing store behind one [`BackingStore`] surface
pub struct CachingStore {
    backing: Arc<dyn BackingStore>,
    dir: PathBuf,
    lock: DirLock,
    readonly: bool,
    account_key_name: Option<String>,
}

impl CachingStore {
    /// Create a caching store in front of `backing`
    ///
    /// Creates the local directory. Readonly instances also create the lock
    /// file up front, since a shared lock can only be taken on an existing
    /// file.
    pub fn new(
        backing: Arc<dyn BackingStore>,
        config: CachingStoreConfig,
    ) -> Result<Self, StoreError> {
        let CachingStoreConfig {
            dir,
            readonly,
            account_key_name,
        } = config;

        store::create_private_dir(&dir)
            .map_err(|e| StoreError::local("create", &dir.display().to_string(), e))?;

        let lock = DirLock::new(&dir);
        if readonly {
            drop(lock.exclusive()?);
        }

        info!(
            dir = %dir.display(),
            readonly = readonly,
            account_key_name = ?account_key_name,
            "Initialized caching store"
        );

        Ok(Self {
            backing,
            dir,
            lock,
            readonly,
            account_key_name,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn route<'a>(&self, key: &'a str) -> Route<'a> {
        if is_account_key(key) {
            if let Some(name) = &self.account_key_name {
                return Route::Backing(Cow::Owned(name.clone()));
            }
        }
        if is_local_only(key) {
            Route::Local
        } else {
            Route::Backing(Cow::Borrowed(key))
        }
    }

    /// Run `f` against the local directory while holding the lock
    async fn with_local<T, F>(&self, op: &'static str, key: &str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
    {
        let lock = self.lock.clone();
        let dir = self.dir.clone();
        let shared = self.readonly;

        trace!(key = %key, op = op, shared = shared, "Local cache operation");
        tokio::task::spawn_blocking(move || {
            let _guard = if shared {
                lock.shared()?
            } else {
                lock.exclusive()?
            };
            f(&dir)
        })
        .await
        .map_err(|e| StoreError::local(op, key, std::io::Error::other(e)))?
    }

    fn wrap_backing(op: &'static str, key: &str, err: StoreError) -> StoreError {
        match err {
            StoreError::CacheMiss => StoreError::CacheMiss,
            other => StoreError::backing(op, key, other),
        }
    }
}

impl fmt::Debug for CachingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingStore")
            .field("dir", &self.dir)
            .field("readonly", &self.readonly)
            .field("account_key_name", &self.account_key_name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BackingStore for CachingStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match self.route(key) {
            Route::Local => {
                let owned = key.to_string();
                self.with_local("get", key, move |dir| {
                    store::read_key(dir, &owned).map_err(|e| StoreError::local("get", &owned, e))
                })
                .await
            }
            Route::Backing(name) => {
                debug!(key = %key, backing_key = %name, "Reading from backing store");
                self.backing
                    .get(&name)
                    .await
                    .map_err(|e| Self::wrap_backing("get", &name, e))
            }
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        if self.readonly {
            return Err(StoreError::Readonly);
        }

        match self.route(key) {
            Route::Local => {
                let owned = key.to_string();
                let data = data.to_vec();
                self.with_local("put", key, move |dir| {
                    store::write_key(dir, &owned, &data)
                        .map_err(|e| StoreError::local("put", &owned, e))
                })
                .await
            }
            Route::Backing(name) => {
                debug!(key = %key, backing_key = %name, "Writing to backing store");
                self.backing
                    .put(&name, data)
                    .await
                    .map_err(|e| Self::wrap_backing("put", &name, e))
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.readonly {
            return Err(StoreError::Readonly);
        }

        match self.route(key) {
            Route::Local => {
                let owned = key.to_string();
                self.with_local("delete", key, move |dir| {
                    store::remove_key(dir, &owned)
                        .map_err(|e| StoreError::local("delete", &owned, e))
                })
                .await
            }
            Route::Backing(name) => {
                debug!(key = %key, backing_key = %name, "Deleting from backing store");
                self.backing
                    .delete(&name)
                    .await
                    .map_err(|e| Self::wrap_backing("delete", &name, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    const LOCAL_KEYS: [&str; 5] = [
        "abc123+token",
        "example.com+rsa",
        "example.com+http-01",
        "acme_account+key",
        "acme_account.key",
    ];

    fn setup(
        config: impl FnOnce(PathBuf) -> CachingStoreConfig,
    ) -> (TempDir, Arc<MemoryStore>, CachingStore) {
        let temp_dir = TempDir::new().unwrap();
        let backing = Arc::new(MemoryStore::new());
        let store =
            CachingStore::new(backing.clone(), config(temp_dir.path().join("acme"))).unwrap();
        (temp_dir, backing, store)
    }

    #[tokio::test]
    async fn test_creates_directory() {
        let (_temp_dir, _backing, store) = setup(|dir| CachingStoreConfig::new(dir));
        assert!(store.dir().is_dir());
        // Writable stores create the lock file lazily
        assert!(!store.dir().join(LOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_readonly_creates_lock_file() {
        let (_temp_dir, _backing, store) = setup(|dir| CachingStoreConfig::new(dir).readonly(true));
        assert!(store.dir().join(LOCK_FILE_NAME).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_readonly_open_keeps_shared_dir_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("acme");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o750)).unwrap();

        let backing = Arc::new(MemoryStore::new());
        CachingStore::new(backing, CachingStoreConfig::new(&dir).readonly(true)).unwrap();

        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[tokio::test]
    async fn test_local_keys_never_reach_backing() {
        let (_temp_dir, backing, store) = setup(|dir| CachingStoreConfig::new(dir));

        for key in LOCAL_KEYS {
            store.put(key, key.as_bytes()).await.unwrap();
            assert_eq!(store.get(key).await.unwrap(), key.as_bytes());
            assert!(store.dir().join(key).exists());
        }
        assert!(backing.keys().is_empty());
        assert_eq!(backing.stats().puts, 0);

        for key in LOCAL_KEYS {
            store.delete(key).await.unwrap();
            assert!(store.get(key).await.unwrap_err().is_cache_miss());
        }
        assert_eq!(backing.stats().misses, 0);
    }

    #[tokio::test]
    async fn test_hostnames_go_to_backing() {
        let (_temp_dir, backing, store) = setup(|dir| CachingStoreConfig::new(dir));

        store.put("example.com", b"pem").await.unwrap();
        assert_eq!(backing.keys(), vec!["example.com".to_string()]);
        assert!(!store.dir().join("example.com").exists());
        assert_eq!(store.get("example.com").await.unwrap(), b"pem");

        store.delete("example.com").await.unwrap();
        assert!(backing.keys().is_empty());
    }

    #[tokio::test]
    async fn test_backing_miss_is_cache_miss() {
        let (_temp_dir, _backing, store) = setup(|dir| CachingStoreConfig::new(dir));
        assert!(store.get("missing.com").await.unwrap_err().is_cache_miss());
        assert!(store.get("missing+token").await.unwrap_err().is_cache_miss());
    }

    #[tokio::test]
    async fn test_account_key_alternate_name() {
        let (_temp_dir, backing, store) =
            setup(|dir| CachingStoreConfig::new(dir).account_key_name("acme-account"));

        for key in LOCAL_KEYS {
            store.put(key, b"v").await.unwrap();
        }

        // Only the account key moves, and only under the alternate name
        assert_eq!(backing.keys(), vec!["acme-account".to_string()]);
        assert!(!store.dir().join("acme_account+key").exists());
        assert!(!store.dir().join("acme_account.key").exists());
        assert!(store.dir().join("abc123+token").exists());
        assert_eq!(store.get("acme_account.key").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_readonly_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let backing = Arc::new(MemoryStore::with_entries([("example.com", b"pem".to_vec())]));
        let dir = temp_dir.path().join("acme");

        // Seed the local tier through a writable instance first
        let writable = CachingStore::new(backing.clone(), CachingStoreConfig::new(&dir)).unwrap();
        writable.put("tok+token", b"auth").await.unwrap();

        let store =
            CachingStore::new(backing.clone(), CachingStoreConfig::new(&dir).readonly(true)).unwrap();
        let before = backing.stats();

        for key in ["example.com", "tok+token", "acme_account+key", "new.com"] {
            assert!(store.put(key, b"x").await.unwrap_err().is_readonly());
            assert!(store.delete(key).await.unwrap_err().is_readonly());
        }

        assert_eq!(backing.stats().puts, before.puts);
        assert_eq!(backing.stats().deletes, before.deletes);
        assert_eq!(std::fs::read(dir.join("tok+token")).unwrap(), b"auth");

        // Reads still work on both tiers
        assert_eq!(store.get("example.com").await.unwrap(), b"pem");
        assert_eq!(store.get("tok+token").await.unwrap(), b"auth");
    }

    #[tokio::test]
    async fn test_backing_failure_is_wrapped() {
        let temp_dir = TempDir::new().unwrap();
        let backing = Arc::new(crate::store::DirStore::new(temp_dir.path().join("shared")).unwrap());
        let store = CachingStore::new(backing, CachingStoreConfig::new(temp_dir.path().join("acme"))).unwrap();

        // ".." is a shared key the dir store refuses
        let err = store.put("..", b"x").await.unwrap_err();
        assert!(matches!(err, StoreError::BackingOperation { op: "put", .. }));
        let inner = std::error::Error::source(&err)
            .unwrap()
            .downcast_ref::<StoreError>()
            .unwrap();
        assert!(matches!(inner, StoreError::LocalOperation { .. }));
    }

    #[tokio::test]
    async fn test_readonly_read_waits_for_writer() {
        let (_temp_dir, _backing, store) = setup(|dir| CachingStoreConfig::new(dir).readonly(true));
        let store = Arc::new(store);
        let lock = DirLock::new(store.dir());

        let guard = lock.exclusive().unwrap();
        let read = tokio::spawn({
            let store = store.clone();
            async move { store.get("nothing+token").await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!read.is_finished());

        drop(guard);
        assert!(read.await.unwrap().unwrap_err().is_cache_miss());
    }
}
