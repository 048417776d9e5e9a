use crate::codec::{BincodeCodec, Codec};
use crate::config::DataStoreConfig;
use crate::error::{DataStoreError, Result};
use crate::fingerprint::Fingerprint;
use crate::layout::{check_entry_slot, ensure_dir, ensure_parent, PathResolver};
use crate::lock::LockManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Filesystem-backed key/value store with per-key cross-process locks.
///
/// Entries live at `root/<domain>/[<shard>/]<key>` (see [`PathResolver`]); each holds
/// one payload encoded by `C`. Reads and writes are not interlocked with the locks:
/// callers that need mutual exclusion around `save`/`restore` wrap them in
/// [`DataStore::acquire`] / [`DataStore::release`].
///
/// Writes truncate and rewrite the entry in place. A process killed mid-write leaves a
/// truncated file, which the next `restore` reports as [`DataStoreError::Deserialize`].
///
/// Dropping the store releases every lock it still holds.
#[derive(Debug)]
pub struct DataStore<C = BincodeCodec> {
    resolver: PathResolver,
    codec: C,
    payload_limit_bytes: usize,
    locks: LockManager,
}

impl DataStore<BincodeCodec> {
    pub fn open(config: DataStoreConfig) -> Result<Self> {
        Self::open_with_codec(config, BincodeCodec)
    }
}

impl<C: Codec> DataStore<C> {
    pub fn open_with_codec(config: DataStoreConfig, codec: C) -> Result<Self> {
        let DataStoreConfig {
            root,
            payload_limit_bytes,
        } = config;
        ensure_dir(&root)?;

        let resolver = PathResolver::new(root);
        Ok(Self {
            locks: LockManager::new(resolver.clone()),
            resolver,
            codec,
            payload_limit_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn entry_path(&self, domain: &str, key: &str) -> Result<PathBuf> {
        self.resolver.resolve(domain, key)
    }

    /// Persist `value` under `(domain, key)`, replacing any previous entry.
    pub fn save<T: Serialize + ?Sized>(&self, domain: &str, key: &str, value: &T) -> Result<()> {
        let path = self.resolver.resolve(domain, key)?;

        // Encode before touching the file so an unencodable value leaves the old entry intact.
        let bytes = self
            .codec
            .encode(value)
            .map_err(|err| DataStoreError::Serialize {
                message: err.to_string(),
            })?;
        if bytes.len() > self.payload_limit_bytes {
            return Err(DataStoreError::Serialize {
                message: format!(
                    "encoded payload is {} bytes (limit {} bytes)",
                    bytes.len(),
                    self.payload_limit_bytes
                ),
            });
        }

        check_entry_slot(&path, key)?;
        ensure_parent(&path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| DataStoreError::io(&path, err))?;
        file.write_all(&bytes)
            .map_err(|err| DataStoreError::io(&path, err))?;

        tracing::debug!(
            target: "nova.datastore",
            domain,
            key,
            codec = self.codec.name(),
            bytes = bytes.len(),
            path = %path.display(),
            "saved entry"
        );
        Ok(())
    }

    /// Load the entry for `(domain, key)`.
    ///
    /// Returns `Ok(None)` if it was never saved. A file that exists but does not decode
    /// is an error, never a miss; it is left in place for the caller to inspect or
    /// overwrite.
    pub fn restore<T: DeserializeOwned>(&self, domain: &str, key: &str) -> Result<Option<T>> {
        let path = self.resolver.resolve(domain, key)?;
        let Some(bytes) = self.read_entry(&path)? else {
            tracing::trace!(target: "nova.datastore", domain, key, "entry not found");
            return Ok(None);
        };

        match self.codec.decode(&bytes) {
            Ok(value) => {
                tracing::debug!(
                    target: "nova.datastore",
                    domain,
                    key,
                    codec = self.codec.name(),
                    bytes = bytes.len(),
                    "restored entry"
                );
                Ok(Some(value))
            }
            Err(err) => {
                tracing::warn!(
                    target: "nova.datastore",
                    domain,
                    key,
                    path = %path.display(),
                    error = %err,
                    "failed to decode entry"
                );
                Err(DataStoreError::Deserialize {
                    path,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Whether an entry file exists for `(domain, key)`. Does not decode it.
    pub fn contains(&self, domain: &str, key: &str) -> Result<bool> {
        let path = self.resolver.resolve(domain, key)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if is_missing(&err) => Ok(false),
            Err(err) => Err(DataStoreError::io(&path, err)),
        }
    }

    /// [`DataStore::save`] keyed by the SHA-256 fingerprint of `content`.
    pub fn save_by_content<T: Serialize + ?Sized>(
        &self,
        domain: &str,
        content: impl AsRef<[u8]>,
        value: &T,
    ) -> Result<Fingerprint> {
        let key = Fingerprint::from_bytes(content);
        self.save(domain, key.as_str(), value)?;
        Ok(key)
    }

    /// [`DataStore::restore`] keyed by the SHA-256 fingerprint of `content`.
    pub fn restore_by_content<T: DeserializeOwned>(
        &self,
        domain: &str,
        content: impl AsRef<[u8]>,
    ) -> Result<Option<T>> {
        let key = Fingerprint::from_bytes(content);
        self.restore(domain, key.as_str())
    }

    /// [`DataStore::save`] keyed by the SHA-256 fingerprint of the file at `source`,
    /// typically the source file the cached artifact was computed from.
    pub fn save_file_by_content<T: Serialize + ?Sized>(
        &self,
        domain: &str,
        source: impl AsRef<Path>,
        value: &T,
    ) -> Result<Fingerprint> {
        let key = Fingerprint::from_file(source)?;
        self.save(domain, key.as_str(), value)?;
        Ok(key)
    }

    /// [`DataStore::restore`] keyed by the SHA-256 fingerprint of the file at `source`.
    ///
    /// Editing the source changes its fingerprint, so stale artifacts read back as
    /// `Ok(None)`.
    pub fn restore_file_by_content<T: DeserializeOwned>(
        &self,
        domain: &str,
        source: impl AsRef<Path>,
    ) -> Result<Option<T>> {
        let key = Fingerprint::from_file(source)?;
        self.restore(domain, key.as_str())
    }

    /// Non-blocking exclusive lock on `key`. See [`LockManager::acquire`].
    pub fn acquire(&mut self, key: &str) -> Result<bool> {
        self.locks.acquire(key)
    }

    pub fn acquire_with_timeout(
        &mut self,
        key: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool> {
        self.locks.acquire_with_timeout(key, timeout, poll_interval)
    }

    pub fn release(&mut self, key: &str) {
        self.locks.release(key);
    }

    pub fn release_all(&mut self) {
        self.locks.release_all();
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.is_held(key)
    }

    pub fn held_locks(&self) -> Vec<&str> {
        self.locks.held_keys()
    }

    fn read_entry(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        // A one-character key's path may be a shard directory instead of an entry.
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(None),
            Err(err) if is_missing(&err) => return Ok(None),
            Err(err) => return Err(DataStoreError::io(path, err)),
        }

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if is_missing(&err) => return Ok(None),
            Err(err) => return Err(DataStoreError::io(path, err)),
        };

        let len = file
            .metadata()
            .map_err(|err| DataStoreError::io(path, err))?
            .len();
        if len > self.payload_limit_bytes as u64 {
            return Err(self.oversize(path, len));
        }

        let mut bytes = Vec::with_capacity(len as usize);
        // Bound the read too: the file may grow between `metadata` and here.
        file.take((self.payload_limit_bytes as u64).saturating_add(1))
            .read_to_end(&mut bytes)
            .map_err(|err| DataStoreError::io(path, err))?;
        if bytes.len() > self.payload_limit_bytes {
            return Err(self.oversize(path, bytes.len() as u64));
        }

        Ok(Some(bytes))
    }

    fn oversize(&self, path: &Path, len: u64) -> DataStoreError {
        DataStoreError::Deserialize {
            path: path.to_path_buf(),
            message: format!(
                "entry is {len} bytes (limit {} bytes)",
                self.payload_limit_bytes
            ),
        }
    }
}

// `NotADirectory`: a long key whose shard path is taken by a one-character key's entry.
fn is_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde::Deserialize;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Tokens {
        tokens: u32,
    }

    fn open(tmp: &TempDir) -> DataStore {
        DataStore::open(DataStoreConfig::new(tmp.path().join("data"))).unwrap()
    }

    #[test]
    fn open_creates_root_recursively() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("a").join("b").join("data");
        let store = DataStore::open(DataStoreConfig::new(&root)).unwrap();
        assert!(root.is_dir());
        assert_eq!(store.root(), root);
    }

    #[test]
    fn save_then_restore_sharded_key() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);

        let key = "abcdef0123456789";
        store
            .save("parsed-files", key, &Tokens { tokens: 42 })
            .unwrap();

        let path = tmp
            .path()
            .join("data")
            .join("parsed-files")
            .join("a")
            .join(key);
        assert!(path.is_file());
        assert_eq!(store.entry_path("parsed-files", key).unwrap(), path);
        assert_eq!(
            store.restore::<Tokens>("parsed-files", key).unwrap(),
            Some(Tokens { tokens: 42 })
        );
    }

    #[test]
    fn save_then_restore_short_key() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);

        store
            .save("parsed-files", "short", &Tokens { tokens: 7 })
            .unwrap();
        assert!(tmp
            .path()
            .join("data")
            .join("parsed-files")
            .join("short")
            .is_file());
        assert_eq!(
            store.restore::<Tokens>("parsed-files", "short").unwrap(),
            Some(Tokens { tokens: 7 })
        );
    }

    #[test]
    fn restore_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        assert_eq!(store.restore::<Tokens>("parsed-files", "short").unwrap(), None);
        assert_eq!(
            store
                .restore::<Tokens>("parsed-files", "abcdef0123456789")
                .unwrap(),
            None
        );
        assert!(!store.contains("parsed-files", "short").unwrap());
    }

    #[test]
    fn save_overwrites_and_truncates() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);

        let long: Vec<String> = (0..100).map(|i| format!("token-{i}")).collect();
        store.save("d", "k", &long).unwrap();
        store.save("d", "k", &vec!["x".to_string()]).unwrap();

        assert_eq!(
            store.restore::<Vec<String>>("d", "k").unwrap(),
            Some(vec!["x".to_string()])
        );
    }

    #[test]
    fn corrupt_entry_is_error_not_miss() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.save("d", "k", &Tokens { tokens: 1 }).unwrap();

        let path = store.entry_path("d", "k").unwrap();
        std::fs::write(&path, b"broken").unwrap();

        let err = store.restore::<Tokens>("d", "k").unwrap_err();
        assert!(matches!(err, DataStoreError::Deserialize { .. }), "{err}");
        assert_eq!(err.path(), Some(path.as_path()));
        assert!(err.to_string().contains(&path.display().to_string()));
        // Corrupt data is reported, not discarded.
        assert!(path.is_file());
        assert!(store.contains("d", "k").unwrap());
    }

    #[test]
    fn truncated_write_is_error_not_miss() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store
            .save("d", "k", &vec!["a".repeat(32), "b".repeat(32)])
            .unwrap();

        let path = store.entry_path("d", "k").unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(
            store.restore::<Vec<String>>("d", "k"),
            Err(DataStoreError::Deserialize { .. })
        ));
    }

    #[test]
    fn empty_file_is_error_not_miss() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let path = store.entry_path("d", "k").unwrap();
        ensure_parent(&path).unwrap();
        std::fs::write(&path, b"").unwrap();

        assert!(matches!(
            store.restore::<Tokens>("d", "k"),
            Err(DataStoreError::Deserialize { .. })
        ));
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = DataStoreConfig::new(tmp.path().join("data")).with_payload_limit_bytes(64);
        let store = DataStore::open(config).unwrap();

        let big = "x".repeat(128);
        let err = store.save("d", "k", &big).unwrap_err();
        assert!(matches!(err, DataStoreError::Serialize { .. }), "{err}");
        assert!(!store.contains("d", "k").unwrap());

        let path = store.entry_path("d", "k").unwrap();
        ensure_parent(&path).unwrap();
        std::fs::File::create(&path).unwrap().set_len(65).unwrap();
        let err = store.restore::<String>("d", "k").unwrap_err();
        assert!(err.to_string().contains("limit 64 bytes"), "{err}");
    }

    #[test]
    fn unencodable_value_keeps_previous_entry() {
        let tmp = TempDir::new().unwrap();
        let store =
            DataStore::open_with_codec(DataStoreConfig::new(tmp.path().join("data")), JsonCodec)
                .unwrap();
        store.save("d", "k", &Tokens { tokens: 3 }).unwrap();

        // JSON object keys must be strings.
        let bad: BTreeMap<Vec<u8>, u32> = BTreeMap::from([(vec![1, 2], 3)]);
        let err = store.save("d", "k", &bad).unwrap_err();
        assert!(matches!(err, DataStoreError::Serialize { .. }), "{err}");
        assert_eq!(
            store.restore::<Tokens>("d", "k").unwrap(),
            Some(Tokens { tokens: 3 })
        );
    }

    #[test]
    fn json_codec_restores_dynamic_values() {
        let tmp = TempDir::new().unwrap();
        let store =
            DataStore::open_with_codec(DataStoreConfig::new(tmp.path().join("data")), JsonCodec)
                .unwrap();
        let value = serde_json::json!({"tokens": 42});
        store
            .save("parsed-files", "abcdef0123456789", &value)
            .unwrap();
        assert_eq!(
            store
                .restore::<serde_json::Value>("parsed-files", "abcdef0123456789")
                .unwrap(),
            Some(value)
        );
    }

    #[test]
    fn entries_from_another_codec_are_errors() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        let json = DataStore::open_with_codec(DataStoreConfig::new(&root), JsonCodec).unwrap();
        json.save("d", "k", &Tokens { tokens: 1 }).unwrap();

        let bincode = DataStore::open(DataStoreConfig::new(&root)).unwrap();
        assert!(matches!(
            bincode.restore::<Tokens>("d", "k"),
            Err(DataStoreError::Deserialize { .. })
        ));
    }

    #[test]
    fn content_keyed_entries_are_sharded_by_hash() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);

        let source = b"class Main {}";
        let key = store
            .save_by_content("parsed-files", source, &Tokens { tokens: 4 })
            .unwrap();
        assert_eq!(key, Fingerprint::from_bytes(source));

        let shard = &key.as_str()[..1];
        assert!(tmp
            .path()
            .join("data")
            .join("parsed-files")
            .join(shard)
            .join(key.as_str())
            .is_file());
        assert_eq!(
            store
                .restore_by_content::<Tokens>("parsed-files", source)
                .unwrap(),
            Some(Tokens { tokens: 4 })
        );
        assert_eq!(
            store
                .restore_by_content::<Tokens>("parsed-files", b"class Other {}")
                .unwrap(),
            None
        );
    }

    #[test]
    fn source_file_keyed_entries_follow_file_content() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let source = tmp.path().join("Main.java");
        std::fs::write(&source, b"class Main {}").unwrap();

        let key = store
            .save_file_by_content("parsed-files", &source, &Tokens { tokens: 4 })
            .unwrap();
        assert_eq!(key, Fingerprint::from_bytes(b"class Main {}"));
        assert_eq!(
            store
                .restore_file_by_content::<Tokens>("parsed-files", &source)
                .unwrap(),
            Some(Tokens { tokens: 4 })
        );

        std::fs::write(&source, b"class Main { int x; }").unwrap();
        assert_eq!(
            store
                .restore_file_by_content::<Tokens>("parsed-files", &source)
                .unwrap(),
            None
        );

        let missing = tmp.path().join("Missing.java");
        let err = store
            .restore_file_by_content::<Tokens>("parsed-files", &missing)
            .unwrap_err();
        assert_eq!(err.path(), Some(missing.as_path()));
    }

    #[test]
    fn domains_are_independent() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.save("parsed-files", "k", &1_u32).unwrap();
        store.save("lint-results", "k", &2_u32).unwrap();
        assert_eq!(store.restore::<u32>("parsed-files", "k").unwrap(), Some(1));
        assert_eq!(store.restore::<u32>("lint-results", "k").unwrap(), Some(2));
    }

    #[test]
    fn invalid_names_are_rejected_without_writing() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        assert!(matches!(
            store.save("parsed-files", "../../escape", &1_u32),
            Err(DataStoreError::InvalidName { .. })
        ));
        assert!(matches!(
            store.save("locks", "k", &1_u32),
            Err(DataStoreError::InvalidName { .. })
        ));
        assert!(!tmp.path().join("escape").exists());
        assert!(!tmp.path().join("data").join("locks").exists());
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_domain_is_io_error_with_path() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.save("d", "a", &1_u32).unwrap();

        let domain_dir = tmp.path().join("data").join("d");
        std::fs::set_permissions(&domain_dir, std::fs::Permissions::from_mode(0o555)).unwrap();
        let probe = domain_dir.join(".probe");
        if std::fs::write(&probe, b"").is_ok() {
            // Running as root: permissions are not enforced.
            let _ = std::fs::remove_file(&probe);
            std::fs::set_permissions(&domain_dir, std::fs::Permissions::from_mode(0o755))
                .unwrap();
            return;
        }

        let err = store.save("d", "b", &2_u32).unwrap_err();
        std::fs::set_permissions(&domain_dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(matches!(err, DataStoreError::Io { .. }), "{err}");
        assert_eq!(err.path(), Some(domain_dir.join("b").as_path()));
    }

    #[test]
    fn store_locks_follow_state_machine() {
        let tmp = TempDir::new().unwrap();
        let mut first = open(&tmp);
        let mut second = open(&tmp);

        assert!(first.acquire("abcdef0123456789").unwrap());
        assert!(first.is_locked("abcdef0123456789"));
        assert!(!second.acquire("abcdef0123456789").unwrap());

        first.release("abcdef0123456789");
        assert!(!first.is_locked("abcdef0123456789"));
        assert!(second.acquire("abcdef0123456789").unwrap());
        assert_eq!(second.held_locks(), vec!["abcdef0123456789"]);

        drop(second);
        assert!(first.acquire("abcdef0123456789").unwrap());
        first.release_all();
        assert!(first.held_locks().is_empty());
    }
}
