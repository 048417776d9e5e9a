//! Filesystem-backed persistent key/value store with cross-process advisory locking.
//!
//! Nova uses this to keep computed artifacts (parsed files, lint results) between
//! separate invocations, and to coordinate concurrently running instances that share a
//! data directory.
//!
//! ## On-disk layout
//!
//! Under the configured root:
//! - `<domain>/<key>`: entries whose key is shorter than [`SHARD_THRESHOLD`] chars
//! - `<domain>/<key[0]>/<key>`: longer keys (typically [`Fingerprint`] hex digests),
//!   sharded by their first character
//! - `locks/<key>`: one advisory lock file per key, shared by all domains
//!
//! Entries are encoded by a [`Codec`] inside a small versioned envelope, so foreign or
//! truncated files fail to decode instead of reading back as empty values.
//!
//! ## Concurrency
//!
//! A [`DataStore`] is a single-threaded handle; many processes may open stores on the
//! same root. Locks are exclusive, non-blocking and advisory: only callers that go
//! through [`LockManager`] (or lock the same files with the same OS primitive) are
//! excluded. `save`/`restore` never take locks on their own.
//!
//! ```no_run
//! use nova_datastore::{DataStore, DataStoreConfig};
//!
//! # fn main() -> Result<(), nova_datastore::DataStoreError> {
//! let mut store = DataStore::open(DataStoreConfig::new("/var/cache/nova/datastore"))?;
//! if store.acquire("abcdef0123456789")? {
//!     store.save("parsed-files", "abcdef0123456789", &vec![42_u32])?;
//!     let tokens: Option<Vec<u32>> = store.restore("parsed-files", "abcdef0123456789")?;
//!     assert_eq!(tokens, Some(vec![42]));
//!     store.release("abcdef0123456789");
//! }
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod error;
mod fingerprint;
mod layout;
mod lock;
mod store;

pub use codec::{
    BincodeCodec, Codec, JsonCodec, ENVELOPE_FORMAT_VERSION, ENVELOPE_HEADER_LEN, ENVELOPE_MAGIC,
};
pub use config::{DataStoreConfig, DEFAULT_PAYLOAD_LIMIT_BYTES};
pub use error::{CodecError, DataStoreError, NameKind, Result};
pub use fingerprint::Fingerprint;
pub use layout::{ensure_parent, shard_of, PathResolver, LOCKS_DIR_NAME, SHARD_THRESHOLD};
pub use lock::LockManager;
pub use store::DataStore;
