//! Backend contract for the polymorphic object store.
//!
//! Every backend exposes the same `(namespace, key)` surface; operations a
//! backend cannot express fail with a typed [`StoreError::Unsupported`]
//! instead of panicking at the call site.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Backend selection
// ============================================================================

/// Which concrete store implementation backs a [`crate::Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Plain directory tree, one file per key.
    Simple,
    /// Append-only tar archive with a sidecar index.
    #[serde(rename = "taridx")]
    TarIndex,
    /// Sharded key-value servers with local write affinity.
    Shard,
}

impl BackendKind {
    pub const ALL: &'static [BackendKind] =
        &[BackendKind::Simple, BackendKind::TarIndex, BackendKind::Shard];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Simple => "simple",
            BackendKind::TarIndex => "taridx",
            BackendKind::Shard => "shard",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(BackendKind::Simple),
            "taridx" => Ok(BackendKind::TarIndex),
            "shard" => Ok(BackendKind::Shard),
            _ => Err(StoreError::InvalidBackend(s.to_string())),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid IO backend requested ({0})")]
    InvalidBackend(String),

    #[error("{backend} backend does not support {op}")]
    Unsupported {
        backend: BackendKind,
        op: &'static str,
    },

    #[error("namespace ({namespace}) is missing key ({key})")]
    NotFound { namespace: String, key: String },

    #[error("corrupt store state: {0}")]
    Corrupt(String),

    #[error("timed out waiting for lock on {0}")]
    LockTimeout(PathBuf),

    #[error("no shard servers registered")]
    NoServers,

    #[error("shard server error: {0}")]
    Server(#[from] redis::RedisError),

    #[error("checkpoint format error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Payloads
// ============================================================================

/// A format-agnostic payload. The store never interprets the contents; the
/// variant only records whether the caller handed over text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Bytes(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Text(s) => s.into_bytes(),
            Payload::Bytes(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Bytes(value.to_vec())
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// Uniform `(namespace, key)` object store.
///
/// Batch-read contract: the filesystem and tar backends present an atomic
/// view, so `load_files` returns all `Some` or all `None`. The shard
/// backend fills slots per key. Callers that need the collapsed form go
/// through [`crate::Store::load_all`].
pub trait ObjectStore: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Verify the backend can operate (e.g. a shard binding exists).
    fn check_environment(&self) -> StoreResult<()>;

    fn file_exists(&self, namespace: &str, key: &str) -> StoreResult<bool>;

    fn namespace_exists(&self, namespace: &str) -> StoreResult<bool>;

    /// Keys in `namespace` matching the glob `pattern`; basenames, deduped.
    fn list_keys(&self, namespace: &str, pattern: &str) -> StoreResult<Vec<String>>;

    fn load_files(&self, namespace: &str, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>>;

    fn save_files(&self, namespace: &str, keys: &[String], data: &[Payload]) -> StoreResult<()>;

    /// Best-effort removal; returns the number of keys actually deleted.
    fn remove_files(&self, namespace: &str, keys: &[String]) -> StoreResult<usize>;

    fn move_key(&self, namespace: &str, old: &str, new: &str) -> StoreResult<()>;
}

/// Append `extn` unless the key already carries it.
pub(crate) fn check_extn(name: &str, extn: &str) -> String {
    if name.ends_with(extn) {
        name.to_string()
    } else {
        format!("{name}{extn}")
    }
}
