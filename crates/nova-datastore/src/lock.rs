use crate::error::{DataStoreError, Result};
use crate::layout::{ensure_dir, PathResolver};
use fs2::FileExt as _;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Per-key advisory locks backed by `root/locks/<key>`.
///
/// Locks are exclusive, never block, and are released when the underlying handle is
/// closed: by [`LockManager::release`], when the manager is dropped, or by the OS when
/// the owning process exits. The lock is advisory; it only excludes other callers that
/// lock the same file the same way and does not stop plain readers or writers of entry
/// files.
///
/// `fs2` locks are tied to the open file handle (`flock` on Unix, `LockFileEx` on
/// Windows), so two managers in the same process exclude each other just like two
/// processes do.
#[derive(Debug)]
pub struct LockManager {
    resolver: PathResolver,
    held: HashMap<String, HeldLock>,
}

#[derive(Debug)]
struct HeldLock {
    file: File,
    path: PathBuf,
}

impl LockManager {
    pub fn new(resolver: PathResolver) -> Self {
        Self {
            resolver,
            held: HashMap::new(),
        }
    }

    /// Attempt to take the exclusive lock for `key` without blocking.
    ///
    /// Returns `Ok(false)` when another holder has it. Returns `Ok(true)` without
    /// touching the filesystem if this manager already holds `key`.
    pub fn acquire(&mut self, key: &str) -> Result<bool> {
        if self.held.contains_key(key) {
            return Ok(true);
        }

        let path = self.resolver.lock_path(key)?;
        ensure_dir(&self.resolver.lock_dir())?;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| DataStoreError::io(&path, err))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(
                    target: "nova.datastore",
                    key,
                    path = %path.display(),
                    "acquired lock"
                );
                self.held.insert(key.to_string(), HeldLock { file, path });
                Ok(true)
            }
            Err(err) if is_contended(&err) => {
                // The handle holds nothing; dropping it closes it.
                drop(file);
                tracing::debug!(
                    target: "nova.datastore",
                    key,
                    path = %path.display(),
                    "lock held elsewhere"
                );
                Ok(false)
            }
            Err(err) => Err(DataStoreError::io(&path, err)),
        }
    }

    /// Poll [`LockManager::acquire`] until it succeeds or `timeout` elapses.
    pub fn acquire_with_timeout(
        &mut self,
        key: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acquire(key)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(poll_interval.min(deadline - now));
        }
    }

    /// Release `key` if this manager holds it. Never fails.
    pub fn release(&mut self, key: &str) {
        let Some(lock) = self.held.remove(key) else {
            return;
        };
        unlock_best_effort(key, lock);
    }

    pub fn release_all(&mut self) {
        for (key, lock) in self.held.drain() {
            unlock_best_effort(&key, lock);
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }

    /// Keys currently held by this manager, sorted.
    pub fn held_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.held.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn lock_path(&self, key: &str) -> Result<PathBuf> {
        self.resolver.lock_path(key)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn unlock_best_effort(key: &str, lock: HeldLock) {
    let HeldLock { file, path } = lock;
    // Closing the handle releases the lock even if the explicit unlock fails.
    if let Err(err) = file.unlock() {
        log_unlock_failure(key, &path, &err);
    }
    drop(file);
    tracing::debug!(
        target: "nova.datastore",
        key,
        path = %path.display(),
        "released lock"
    );
}

fn log_unlock_failure(key: &str, path: &Path, err: &io::Error) {
    tracing::debug!(
        target: "nova.datastore",
        key,
        path = %path.display(),
        error = %err,
        "failed to unlock lock file (best effort)"
    );
}

fn is_contended(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    let contended = fs2::lock_contended_error();
    err.raw_os_error().is_some() && err.raw_os_error() == contended.raw_os_error()
}
