//! Local directory store
//!
//! Every key is a file directly under the root directory:
//!
//! ```text
//! root/
//! ├── example.com           # key + certificate chain PEM
//! ├── example.com+rsa
//! └── acme_account+key
//! ```
//!
//! Writes land in a temporary file next to the target and are renamed into
//! place, so a concurrent reader sees either the old or the new contents.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, trace};

use super::{BackingStore, StoreError};

/// Plain file-per-key store rooted at a directory
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Create a store rooted at `root`
    ///
    /// Creates the directory if it doesn't exist and sets restrictive
    /// permissions (0700 on Unix).
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        create_private_dir(&root)
            .map_err(|e| StoreError::local("create", &root.display().to_string(), e))?;

        info!(root = %root.display(), "Initialized directory store");
        Ok(Self { root })
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BackingStore for DirStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let root = self.root.clone();
        let owned = key.to_string();
        run_blocking("get", key, move || read_key(&root, &owned)).await
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let root = self.root.clone();
        let owned = key.to_string();
        let data = data.to_vec();
        run_blocking("put", key, move || write_key(&root, &owned, &data)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let root = self.root.clone();
        let owned = key.to_string();
        run_blocking("delete", key, move || remove_key(&root, &owned)).await
    }
}

async fn run_blocking<T, F>(op: &'static str, key: &str, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::local(op, key, io::Error::other(e)))?
        .map_err(|e| StoreError::local(op, key, e))
}

/// Create `path` (0700 on Unix) unless it already exists
///
/// An existing directory keeps its mode, so several users can share one
/// cache directory.
pub(crate) fn create_private_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    match builder.create(path) {
        Ok(()) => Ok(()),
        // Lost a race with another process creating it
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Resolve `key` to a path directly under `root`
fn key_path(root: &Path, key: &str) -> io::Result<PathBuf> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key.contains('/')
        || key.contains('\\')
        || key.contains('\0');
    if invalid {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid store key {:?}", key),
        ));
    }
    Ok(root.join(key))
}

pub(crate) fn read_key(root: &Path, key: &str) -> io::Result<Vec<u8>> {
    let path = key_path(root, key)?;
    let data = fs::read(&path)?;
    trace!(key = %key, bytes = data.len(), "Read key from directory");
    Ok(data)
}

pub(crate) fn write_key(root: &Path, key: &str, data: &[u8]) -> io::Result<()> {
    let path = key_path(root, key)?;

    // NamedTempFile is created 0600 on Unix
    let mut tmp = tempfile::NamedTempFile::new_in(root)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| e.error)?;

    debug!(key = %key, bytes = data.len(), "Wrote key to directory");
    Ok(())
}

pub(crate) fn remove_key(root: &Path, key: &str) -> io::Result<()> {
    let path = key_path(root, key)?;
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!(key = %key, "Removed key from directory");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            trace!(key = %key, "Key to remove not found");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_store() -> (TempDir, DirStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = DirStore::new(temp_dir.path().join("certs")).unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_store_creation() {
        let (_temp_dir, store) = setup_store();
        assert!(store.root().is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(store.root()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_dir_keeps_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("shared");
        fs::create_dir(&root).unwrap();
        fs::set_permissions(&root, fs::Permissions::from_mode(0o750)).unwrap();

        DirStore::new(&root).unwrap();

        let mode = fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[tokio::test]
    async fn test_put_get() {
        let (_temp_dir, store) = setup_store();

        store.put("example.com", b"pem data").await.unwrap();
        assert_eq!(store.get("example.com").await.unwrap(), b"pem data");

        store.put("example.com", b"replaced").await.unwrap();
        assert_eq!(store.get("example.com").await.unwrap(), b"replaced");
    }

    #[tokio::test]
    async fn test_get_missing_is_cache_miss() {
        let (_temp_dir, store) = setup_store();
        let err = store.get("missing.example.com").await.unwrap_err();
        assert!(err.is_cache_miss());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_temp_dir, store) = setup_store();

        store.put("delete.com", b"x").await.unwrap();
        store.delete("delete.com").await.unwrap();
        assert!(store.get("delete.com").await.unwrap_err().is_cache_miss());

        // Deleting again is not an error
        store.delete("delete.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_keys() {
        let (_temp_dir, store) = setup_store();

        for key in ["", ".", "..", "../escape", "a/b"] {
            let err = store.put(key, b"x").await.unwrap_err();
            assert!(
                matches!(err, StoreError::LocalOperation { .. }),
                "key {:?} gave {:?}",
                key,
                err
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_written_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp_dir, store) = setup_store();
        store.put("acme_account+key", b"secret").await.unwrap();

        let mode = fs::metadata(store.root().join("acme_account+key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
