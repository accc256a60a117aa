//! Advisory lock over a cache directory
//!
//! One lock file per directory, locked with `flock(2)`. Locks belong to the
//! open file description, so two handles in the same process contend just
//! like two processes do.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::trace;

use crate::store::StoreError;

/// Lock file created inside every cache directory
pub const LOCK_FILE_NAME: &str = ".certcache.lock";

/// Whole-directory lock
#[derive(Debug, Clone)]
pub struct DirLock {
    path: PathBuf,
}

/// Held lock; released on drop
pub struct LockGuard {
    _flock: Flock<File>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockGuard")
    }
}

impl DirLock {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(LOCK_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the exclusive lock is held, creating the lock file if needed
    pub fn exclusive(&self) -> Result<LockGuard, StoreError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let file = options.open(&self.path).map_err(|e| self.failed(e))?;
        self.acquire(file, FlockArg::LockExclusive)
    }

    /// Block until a shared lock is held
    ///
    /// The lock file must already exist.
    pub fn shared(&self) -> Result<LockGuard, StoreError> {
        let file = File::open(&self.path).map_err(|e| self.failed(e))?;
        self.acquire(file, FlockArg::LockShared)
    }

    fn acquire(&self, file: File, arg: FlockArg) -> Result<LockGuard, StoreError> {
        let flock = Flock::lock(file, arg).map_err(|(_, errno)| self.failed(errno.into()))?;
        trace!(path = %self.path.display(), mode = ?arg, "Acquired cache lock");
        Ok(LockGuard { _flock: flock })
    }

    fn failed(&self, source: io::Error) -> StoreError {
        StoreError::LockFailed {
            path: self.path.clone(),
            source,
        }
    }
}
