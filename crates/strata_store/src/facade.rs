//! Backend selection facade and convenience operations.

use crate::backend::{check_extn, BackendKind, ObjectStore, Payload, StoreResult};
use crate::bundle::{decode_bundle, encode_bundle, ArrayBundle};
use crate::shard::{ShardConfig, ShardStore};
use crate::simple::FsStore;
use crate::taridx::TarStore;
use std::fs;
use std::path::Path;
use strata_protocol::NamingContext;
use tracing::info;

/// File extension for array bundles.
const BUNDLE_EXTN: &str = ".sfb";

/// A uniform `(namespace, key)` store with the backend chosen at open time.
pub struct Store {
    backend: Box<dyn ObjectStore>,
}

impl Store {
    /// Select and verify a backend for the given campaign context.
    pub fn open(kind: BackendKind, ctx: &NamingContext) -> StoreResult<Self> {
        let backend: Box<dyn ObjectStore> = match kind {
            BackendKind::Simple => Box::new(FsStore::new()),
            BackendKind::TarIndex => Box::new(TarStore::new()),
            BackendKind::Shard => Box::new(ShardStore::new(ShardConfig::from_context(ctx))),
        };
        backend.check_environment()?;
        Ok(Self { backend })
    }

    /// Wrap an explicit backend (tests, custom shard configs).
    pub fn with_backend(backend: Box<dyn ObjectStore>) -> Self {
        Self { backend }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    // ------------------------------------------------------------------
    // Passthrough surface
    // ------------------------------------------------------------------

    pub fn file_exists(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        self.backend.file_exists(namespace, key)
    }

    pub fn namespace_exists(&self, namespace: &str) -> StoreResult<bool> {
        self.backend.namespace_exists(namespace)
    }

    pub fn list_keys(&self, namespace: &str, pattern: &str) -> StoreResult<Vec<String>> {
        self.backend.list_keys(namespace, pattern)
    }

    pub fn load_files(
        &self,
        namespace: &str,
        keys: &[String],
    ) -> StoreResult<Vec<Option<Vec<u8>>>> {
        self.backend.load_files(namespace, keys)
    }

    pub fn save_files(
        &self,
        namespace: &str,
        keys: &[String],
        data: &[Payload],
    ) -> StoreResult<()> {
        self.backend.save_files(namespace, keys, data)
    }

    pub fn remove_files(&self, namespace: &str, keys: &[String]) -> StoreResult<usize> {
        self.backend.remove_files(namespace, keys)
    }

    pub fn move_key(&self, namespace: &str, old: &str, new: &str) -> StoreResult<()> {
        self.backend.move_key(namespace, old, new)
    }

    // ------------------------------------------------------------------
    // Single-key conveniences
    // ------------------------------------------------------------------

    pub fn load_file(&self, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut batch = self.load_files(namespace, &[key.to_string()])?;
        Ok(batch.pop().flatten())
    }

    pub fn save_file(
        &self,
        namespace: &str,
        key: &str,
        payload: impl Into<Payload>,
    ) -> StoreResult<()> {
        self.save_files(namespace, &[key.to_string()], &[payload.into()])
    }

    /// Collapse a batch to `Some` only when every key was found.
    pub fn load_all(&self, namespace: &str, keys: &[String]) -> StoreResult<Option<Vec<Vec<u8>>>> {
        let batch = self.load_files(namespace, keys)?;
        Ok(batch.into_iter().collect())
    }

    // ------------------------------------------------------------------
    // Array bundles
    // ------------------------------------------------------------------

    pub fn save_bundle(&self, namespace: &str, key: &str, bundle: &ArrayBundle) -> StoreResult<()> {
        let key = check_extn(key, BUNDLE_EXTN);
        let bytes = encode_bundle(bundle)?;
        self.save_files(namespace, &[key], &[Payload::Bytes(bytes)])
    }

    pub fn load_bundle(&self, namespace: &str, key: &str) -> StoreResult<Option<ArrayBundle>> {
        let key = check_extn(key, BUNDLE_EXTN);
        match self.load_file(namespace, &key)? {
            Some(bytes) => Ok(Some(decode_bundle(&bytes)?)),
            None => Ok(None),
        }
    }
}

// ----------------------------------------------------------------------
// Signals: marker files a running simulation publishes in its own workdir
// ----------------------------------------------------------------------

/// Touch the marker file `name` in `dir` (content is a single `1`).
pub fn send_signal(dir: &Path, name: &str) -> StoreResult<()> {
    let file = dir.join(name);
    fs::write(&file, "1")?;
    info!("Saved signal ({})", file.display());
    Ok(())
}

/// Presence of the marker file; an empty name never matches.
pub fn test_signal(dir: &Path, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    dir.join(name).is_file()
}
