//! Mapping from `(domain, key)` addresses to paths under the data directory.

use crate::error::{DataStoreError, NameKind, Result};
use std::path::{Path, PathBuf};

/// Keys with at least this many characters are stored under a one-character shard
/// directory to bound per-directory entry counts.
pub const SHARD_THRESHOLD: usize = 16;

/// Directory (relative to the root) holding one lock file per key.
pub const LOCKS_DIR_NAME: &str = "locks";

/// Resolves entry and lock file paths below a fixed root.
///
/// Layout:
/// - `root/<domain>/<key>` for keys shorter than [`SHARD_THRESHOLD`]
/// - `root/<domain>/<key[0]>/<key>` otherwise
/// - `root/locks/<key>` for lock files, independent of the domain
#[derive(Clone, Debug)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the entry path for `(domain, key)`.
    ///
    /// Pure: no filesystem access. Names that are not a single, normal path
    /// component are rejected, as are sharded keys starting with `.` (their shard
    /// would be the domain directory itself).
    pub fn resolve(&self, domain: &str, key: &str) -> Result<PathBuf> {
        validate_domain(domain)?;
        validate_entry_key(key)?;

        let mut path = self.root.join(domain);
        if let Some(shard) = shard_of(key) {
            path.push(shard.encode_utf8(&mut [0_u8; 4]));
        }
        path.push(key);
        Ok(path)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR_NAME)
    }

    pub fn lock_path(&self, key: &str) -> Result<PathBuf> {
        validate_name(NameKind::Key, key)?;
        Ok(self.lock_dir().join(key))
    }
}

/// Returns the shard directory name for `key`, or `None` if the key is stored
/// directly under its domain.
pub fn shard_of(key: &str) -> Option<char> {
    if key.chars().count() >= SHARD_THRESHOLD {
        key.chars().next()
    } else {
        None
    }
}

/// Creates every ancestor directory of `path`.
///
/// Other processes may be creating the same directories concurrently; a directory
/// that already exists is success.
pub fn ensure_parent(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir(parent)
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|err| DataStoreError::io(dir, err))
}

/// Checks that writing the entry for `key` at `path` does not clash with another
/// entry's on-disk slot.
///
/// One-character keys share a namespace with shard directories: `d/a` is either the
/// entry for key `a` or the shard holding every long key starting with `a`. Whichever
/// is written first wins; the other is reported as [`DataStoreError::EntryConflict`].
pub(crate) fn check_entry_slot(path: &Path, key: &str) -> Result<()> {
    if is_dir_no_follow(path) {
        return Err(DataStoreError::EntryConflict {
            path: path.to_path_buf(),
            reason: "a shard directory of longer keys occupies this key's path",
        });
    }

    if shard_of(key).is_some() {
        if let Some(shard_dir) = path.parent() {
            if let Ok(meta) = std::fs::symlink_metadata(shard_dir) {
                if !meta.is_dir() {
                    return Err(DataStoreError::EntryConflict {
                        path: shard_dir.to_path_buf(),
                        reason: "the entry of a one-character key occupies this shard directory",
                    });
                }
            }
        }
    }
    Ok(())
}

fn is_dir_no_follow(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok_and(|meta| meta.is_dir())
}

fn validate_entry_key(key: &str) -> Result<()> {
    validate_name(NameKind::Key, key)?;
    if shard_of(key) == Some('.') {
        return Err(DataStoreError::InvalidName {
            kind: NameKind::Key,
            name: key.to_string(),
            reason: "sharded keys must not start with '.'",
        });
    }
    Ok(())
}

fn validate_domain(domain: &str) -> Result<()> {
    validate_name(NameKind::Domain, domain)?;
    if domain == LOCKS_DIR_NAME {
        return Err(DataStoreError::InvalidName {
            kind: NameKind::Domain,
            name: domain.to_string(),
            reason: "reserved for lock files",
        });
    }
    Ok(())
}

fn validate_name(kind: NameKind, name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name == "." || name == ".." {
        "reserved path component"
    } else if name.contains(['/', '\\', '\0']) {
        "must not contain path separators or NUL"
    } else {
        return Ok(());
    };

    Err(DataStoreError::InvalidName {
        kind,
        name: name.to_string(),
        reason,
    })
}
