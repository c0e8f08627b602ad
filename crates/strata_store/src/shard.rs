//! Sharded KV backend: a pool of key-value servers with local write affinity.
//!
//! Writes land only on the server this process is bound to; reads fan out
//! across the registry in declaration order, asking each server only for
//! the keys still missing. Individual server failures degrade a read to
//! "found nothing here" rather than failing the batch.

use crate::backend::{BackendKind, ObjectStore, Payload, StoreError, StoreResult};
use crate::registry::{LocalBinding, ServerAddr, ShardRegistry};
use redis::Commands;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, error, info};

/// Where the shard pool is declared and where this process persists its
/// local binding.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub registry: PathBuf,
    pub state_dir: PathBuf,
}

impl ShardConfig {
    pub fn new(registry: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry: registry.into(),
            state_dir: state_dir.into(),
        }
    }

    /// Registry under the campaign root, binding under the system tmp dir.
    pub fn from_context(ctx: &strata_protocol::NamingContext) -> Self {
        Self {
            registry: ctx.shard_registry(),
            state_dir: std::env::temp_dir().join("strataflow"),
        }
    }
}

pub struct ShardStore {
    registry: ShardRegistry,
    binding: LocalBinding,
    bound: Mutex<Option<ServerAddr>>,
}

impl ShardStore {
    pub fn new(config: ShardConfig) -> Self {
        Self {
            registry: ShardRegistry::new(config.registry),
            binding: LocalBinding::new(config.state_dir),
            bound: Mutex::new(None),
        }
    }

    /// Wire key for `(namespace, key)`.
    fn format_key(namespace: &str, key: &str) -> String {
        format!("{namespace}::{key}")
    }

    fn key_prefix(namespace: &str) -> String {
        format!("{namespace}::")
    }

    fn connect(server: &ServerAddr) -> StoreResult<redis::Connection> {
        let client = redis::Client::open(server.url().as_str())?;
        Ok(client.get_connection()?)
    }

    /// The server this process writes to, binding lazily on first use.
    fn local_server(&self) -> StoreResult<ServerAddr> {
        let mut bound = self.bound.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(addr) = bound.as_ref() {
            return Ok(addr.clone());
        }
        let addr = self.binding.bind(&self.registry)?;
        *bound = Some(addr.clone());
        Ok(addr)
    }

    /// Append a server to the shared pool declaration.
    pub fn bind_global(&self, server: &ServerAddr) -> StoreResult<()> {
        self.registry.register(server)
    }

    /// Fetch the subset of `keys` present on one server.
    pub fn load_files_at_server(
        &self,
        namespace: &str,
        keys: &[String],
        server: &ServerAddr,
    ) -> StoreResult<HashMap<String, Vec<u8>>> {
        let mut con = Self::connect(server)?;
        let mut found = HashMap::new();
        for key in keys {
            let rkey = Self::format_key(namespace, key);
            if con.exists::<_, bool>(&rkey)? {
                let value: Vec<u8> = con.get(&rkey)?;
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    /// Delete the subset of `keys` present on one server; returns the count.
    pub fn remove_files_at_server(
        &self,
        namespace: &str,
        keys: &[String],
        server: &ServerAddr,
    ) -> StoreResult<usize> {
        let mut con = Self::connect(server)?;
        let mut removed = 0;
        for key in keys {
            let rkey = Self::format_key(namespace, key);
            if con.exists::<_, bool>(&rkey)? {
                con.del::<_, ()>(&rkey)?;
                removed += 1;
            }
        }
        debug!("Deleted {} out of {} keys at {}", removed, keys.len(), server);
        Ok(removed)
    }

    /// Per-server key listing for a namespace pattern, keyed by host.
    pub fn list_servers_to_keys(
        &self,
        namespace: &str,
        pattern: &str,
    ) -> StoreResult<BTreeMap<String, Vec<String>>> {
        let wire_pattern = Self::format_key(namespace, pattern);
        let prefix = Self::key_prefix(namespace);

        let mut by_server = BTreeMap::new();
        for server in self.registry.read()? {
            let keys = match Self::connect(&server)
                .and_then(|mut con| Ok(con.keys::<_, Vec<String>>(&wire_pattern)?))
            {
                Ok(keys) => keys,
                Err(e) => {
                    error!("Failed to list keys at {}: {}", server, e);
                    continue;
                }
            };
            let names: Vec<String> = keys
                .into_iter()
                .map(|k| k.strip_prefix(&prefix).map(str::to_string).unwrap_or(k))
                .collect();
            by_server.insert(server.host.clone(), names);
        }
        Ok(by_server)
    }
}

impl ObjectStore for ShardStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Shard
    }

    fn check_environment(&self) -> StoreResult<()> {
        self.local_server().map(|_| ())
    }

    fn file_exists(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        let rkey = Self::format_key(namespace, key);
        for server in self.registry.read()? {
            match Self::connect(&server).and_then(|mut con| Ok(con.exists::<_, bool>(&rkey)?)) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => error!("Failed to check ({}) at {}: {}", rkey, server, e),
            }
        }
        Ok(false)
    }

    fn namespace_exists(&self, _namespace: &str) -> StoreResult<bool> {
        // Callers list with pattern "*" and test emptiness instead.
        Err(StoreError::Unsupported {
            backend: BackendKind::Shard,
            op: "namespace_exists",
        })
    }

    fn list_keys(&self, namespace: &str, pattern: &str) -> StoreResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for names in self.list_servers_to_keys(namespace, pattern)?.into_values() {
            for name in names {
                if seen.insert(name.clone()) {
                    keys.push(name);
                }
            }
        }
        Ok(keys)
    }

    fn load_files(&self, namespace: &str, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        let mut data: Vec<Option<Vec<u8>>> = vec![None; keys.len()];
        let mut remaining: Vec<String> = keys.to_vec();

        let servers = self.registry.read()?;
        for server in &servers {
            if remaining.is_empty() {
                break;
            }
            let found = match self.load_files_at_server(namespace, &remaining, server) {
                Ok(found) => found,
                Err(e) => {
                    error!("Failed to load files at {}: {}", server, e);
                    continue;
                }
            };
            remaining.retain(|k| !found.contains_key(k));
            for (key, value) in found {
                // Input order is preserved; duplicates fill every slot.
                for (i, k) in keys.iter().enumerate() {
                    if *k == key {
                        data[i] = Some(value.clone());
                    }
                }
            }
        }

        debug!(
            "Loaded {} out of {} keys across {} servers",
            keys.len() - remaining.len(),
            keys.len(),
            servers.len()
        );
        Ok(data)
    }

    fn save_files(&self, namespace: &str, keys: &[String], data: &[Payload]) -> StoreResult<()> {
        debug_assert_eq!(keys.len(), data.len());
        debug!("Writing {} files to ({})", keys.len(), namespace);

        let server = self.local_server()?;
        let mut con = Self::connect(&server)?;
        for (key, payload) in keys.iter().zip(data) {
            let rkey = Self::format_key(namespace, key);
            con.set::<_, _, ()>(&rkey, payload.as_bytes())?;
        }
        info!("Wrote {} files to server {}", keys.len(), server);
        Ok(())
    }

    fn remove_files(&self, namespace: &str, keys: &[String]) -> StoreResult<usize> {
        let servers = self.registry.read()?;
        let mut removed = 0;
        for server in &servers {
            match self.remove_files_at_server(namespace, keys, server) {
                Ok(n) => removed += n,
                Err(e) => error!("Failed to delete keys in ({}) at {}: {}", namespace, server, e),
            }
        }
        debug!(
            "Removed {} out of {} keys across {} servers",
            removed,
            keys.len(),
            servers.len()
        );
        Ok(removed)
    }

    fn move_key(&self, _namespace: &str, _old: &str, _new: &str) -> StoreResult<()> {
        Err(StoreError::Unsupported {
            backend: BackendKind::Shard,
            op: "move_key",
        })
    }
}
