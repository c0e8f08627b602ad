//! Plain filesystem backend: `(ns, k)` maps to the file `{ns}/{k}`.

use crate::backend::{BackendKind, ObjectStore, Payload, StoreError, StoreResult};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct FsStore;

impl FsStore {
    pub fn new() -> Self {
        Self
    }

    fn path(namespace: &str, key: &str) -> PathBuf {
        Path::new(namespace).join(key)
    }
}

impl ObjectStore for FsStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Simple
    }

    fn check_environment(&self) -> StoreResult<()> {
        Ok(())
    }

    fn file_exists(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        Ok(Self::path(namespace, key).is_file())
    }

    fn namespace_exists(&self, namespace: &str) -> StoreResult<bool> {
        Ok(Path::new(namespace).is_dir())
    }

    fn list_keys(&self, namespace: &str, pattern: &str) -> StoreResult<Vec<String>> {
        let full = Path::new(namespace).join(pattern);
        let matcher = glob::glob(&full.to_string_lossy())
            .map_err(|e| StoreError::Corrupt(format!("bad key pattern ({pattern}): {e}")))?;

        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for entry in matcher {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping unreadable entry in ({}): {}", namespace, e);
                    continue;
                }
            };
            if let Some(name) = path.file_name() {
                let name = name.to_string_lossy().into_owned();
                if seen.insert(name.clone()) {
                    keys.push(name);
                }
            }
        }
        Ok(keys)
    }

    fn load_files(&self, namespace: &str, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        // All-or-nothing view: a single missing key empties the whole batch.
        for key in keys {
            if !Self::path(namespace, key).is_file() {
                debug!("File ({}) does not exist in ({})", key, namespace);
                return Ok(vec![None; keys.len()]);
            }
        }

        let mut data = Vec::with_capacity(keys.len());
        for key in keys {
            data.push(Some(fs::read(Self::path(namespace, key))?));
        }
        Ok(data)
    }

    fn save_files(&self, namespace: &str, keys: &[String], data: &[Payload]) -> StoreResult<()> {
        debug_assert_eq!(keys.len(), data.len());
        fs::create_dir_all(namespace)?;

        for (key, payload) in keys.iter().zip(data) {
            fs::write(Self::path(namespace, key), payload.as_bytes())?;
        }
        info!("Wrote {} files to ({})", keys.len(), namespace);
        Ok(())
    }

    fn remove_files(&self, namespace: &str, keys: &[String]) -> StoreResult<usize> {
        let mut removed = 0;
        for key in keys {
            match fs::remove_file(Self::path(namespace, key)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("File ({}) does not exist in ({})", key, namespace);
                }
                Err(e) => {
                    warn!("Failed to remove ({}) from ({}): {}", key, namespace, e);
                }
            }
        }
        Ok(removed)
    }

    fn move_key(&self, namespace: &str, old: &str, new: &str) -> StoreResult<()> {
        debug!("moving ({}) to ({}) in namespace ({})", old, new, namespace);
        fs::rename(Self::path(namespace, old), Self::path(namespace, new))?;
        Ok(())
    }
}
