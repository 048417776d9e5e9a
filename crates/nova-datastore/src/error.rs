use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, DataStoreError>;

/// Errors produced by the data store and its lock manager.
///
/// Lock contention and missing entries are not errors: they surface as
/// `Ok(false)` from `acquire` and `Ok(None)` from `restore`.
#[derive(Debug, thiserror::Error)]
pub enum DataStoreError {
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode entry at {}: {message}", .path.display())]
    Deserialize { path: PathBuf, message: String },

    #[error("entry path {} conflicts with the store layout: {reason}", .path.display())]
    EntryConflict { path: PathBuf, reason: &'static str },

    #[error("failed to encode value: {message}")]
    Serialize { message: String },

    #[error("invalid {kind} {name:?}: {reason}")]
    InvalidName {
        kind: NameKind,
        name: String,
        reason: &'static str,
    },
}

/// Which half of an entry address failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameKind {
    Domain,
    Key,
}

impl std::fmt::Display for NameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NameKind::Domain => f.write_str("domain"),
            NameKind::Key => f.write_str("key"),
        }
    }
}

impl DataStoreError {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Returns the filesystem path the error is about, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Io { path, .. }
            | Self::Deserialize { path, .. }
            | Self::EntryConflict { path, .. } => Some(path),
            Self::Serialize { .. } | Self::InvalidName { .. } => None,
        }
    }
}

/// Codec-level failure, before the store attaches the entry path.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{0}")]
    Encode(String),

    #[error("{0}")]
    Decode(String),
}

impl CodecError {
    /// Decode failures echo fragments of the stored payload (`invalid type: string
    /// "..."`); cached artifacts carry user source, so quoted text is redacted.
    pub(crate) fn json_decode(err: &serde_json::Error) -> Self {
        Self::Decode(redact_quoted(&err.to_string()))
    }

    pub(crate) fn json_encode(err: &serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

fn redact_quoted(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut in_quote = false;
    let mut escaped = false;
    for ch in message.chars() {
        if !in_quote {
            out.push(ch);
            in_quote = ch == '"';
            continue;
        }
        match ch {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => {
                out.push_str("<redacted>\"");
                in_quote = false;
            }
            _ => {}
        }
    }
    if in_quote {
        out.push_str("<redacted>");
    }
    out
}
