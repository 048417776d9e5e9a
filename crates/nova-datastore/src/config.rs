use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default upper bound for any payload the store will attempt to decode.
///
/// A corrupt length prefix should fail the decode, not request an enormous allocation.
pub const DEFAULT_PAYLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Configuration for opening a [`crate::DataStore`].
///
/// The embedding application owns the root directory; this crate never consults
/// environment variables or user directories to pick one. The struct deserializes
/// from the application's own config file:
///
/// ```toml
/// root = "/var/cache/nova/datastore"
/// payload_limit_bytes = 16777216
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataStoreConfig {
    /// Data directory; created recursively when the store is opened.
    pub root: PathBuf,
    /// Maximum payload size accepted by decoding codecs.
    #[serde(default = "default_payload_limit_bytes")]
    pub payload_limit_bytes: usize,
}

impl DataStoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            payload_limit_bytes: DEFAULT_PAYLOAD_LIMIT_BYTES,
        }
    }

    pub fn with_payload_limit_bytes(mut self, limit: usize) -> Self {
        self.payload_limit_bytes = limit;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn default_payload_limit_bytes() -> usize {
    DEFAULT_PAYLOAD_LIMIT_BYTES
}
