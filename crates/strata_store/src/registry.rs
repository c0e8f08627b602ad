//! Shard server registry and per-process local binding.
//!
//! The registry is a shared text file (one `host port` per line) naming
//! every KV server in the pool. Each process binds exactly one "local"
//! server: the persisted prior choice when it is still registered, else a
//! uniformly random pick. Registry and binding writes are serialized with
//! cooperative file locks so concurrent process starts do not race.

use crate::backend::{StoreError, StoreResult};
use fs2::FileExt;
use rand::seq::SliceRandom;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Bounded wait for registry/binding locks.
const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(100);

/// One server in the shard pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Registry line form.
    pub fn to_line(&self) -> String {
        format!("{} {}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddr {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let host = fields.next();
        let port = fields.next().and_then(|p| p.parse().ok());
        match (host, port, fields.next()) {
            (Some(host), Some(port), None) => Ok(Self::new(host, port)),
            _ => Err(StoreError::Corrupt(format!("bad server line: '{s}'"))),
        }
    }
}

/// Run `body` while holding an exclusive lock on `lock_path`, waiting at
/// most [`LOCK_WAIT`].
fn with_file_lock<T>(lock_path: &Path, body: impl FnOnce() -> StoreResult<T>) -> StoreResult<T> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;

    let deadline = Instant::now() + LOCK_WAIT;
    loop {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => break,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(StoreError::LockTimeout(lock_path.to_path_buf()));
                }
                std::thread::sleep(LOCK_POLL);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let out = body();
    let _ = FileExt::unlock(&file);
    out
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(".lock");
    PathBuf::from(p)
}

/// The shared pool declaration file.
#[derive(Debug, Clone)]
pub struct ShardRegistry {
    path: PathBuf,
}

impl ShardRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All registered servers, in declaration order. A missing registry is
    /// an empty pool, not an error.
    pub fn read(&self) -> StoreResult<Vec<ServerAddr>> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(ServerAddr::from_str)
            .collect()
    }

    /// Append a server to the pool under the registry lock.
    pub fn register(&self, addr: &ServerAddr) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        with_file_lock(&lock_path_for(&self.path), || {
            let mut file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.path)?;
            writeln!(file, "{}", addr.to_line())?;
            Ok(())
        })?;
        info!("Registered shard server {} in ({})", addr, self.path.display());
        Ok(())
    }
}

/// Per-process binding to one server of the pool, persisted under a local
/// state directory so restarts keep their affinity.
#[derive(Debug, Clone)]
pub struct LocalBinding {
    state_dir: PathBuf,
}

impl LocalBinding {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self { state_dir: state_dir.into() }
    }

    fn binding_file(&self) -> PathBuf {
        self.state_dir.join("server.txt")
    }

    /// Bind this process to one registered server: reuse the persisted
    /// choice while it remains registered, else pick uniformly at random
    /// and persist.
    pub fn bind(&self, registry: &ShardRegistry) -> StoreResult<ServerAddr> {
        let servers = registry.read()?;
        if servers.is_empty() {
            return Err(StoreError::NoServers);
        }

        fs::create_dir_all(&self.state_dir)?;
        let binding_file = self.binding_file();
        with_file_lock(&lock_path_for(&binding_file), || {
            if binding_file.is_file() {
                let line = fs::read_to_string(&binding_file)?;
                if let Ok(prior) = line.trim().parse::<ServerAddr>() {
                    if servers.contains(&prior) {
                        debug!("Re-using server binding at {}", prior);
                        return Ok(prior);
                    }
                }
            }

            let chosen = servers
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or(StoreError::NoServers)?;
            fs::write(&binding_file, chosen.to_line())?;
            info!("Bound local shard server {}", chosen);
            Ok(chosen)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn server_addr_parses_registry_lines() {
        let addr: ServerAddr = "node12 6379".parse().unwrap();
        assert_eq!(addr, ServerAddr::new("node12", 6379));
        assert_eq!(addr.to_line(), "node12 6379");
        assert!("node12".parse::<ServerAddr>().is_err());
        assert!("node12 port".parse::<ServerAddr>().is_err());
    }

    #[test]
    fn register_then_read_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let registry = ShardRegistry::new(tmp.path().join("redis").join("all_servers.txt"));

        registry.register(&ServerAddr::new("a", 1)).unwrap();
        registry.register(&ServerAddr::new("b", 2)).unwrap();
        registry.register(&ServerAddr::new("c", 3)).unwrap();

        let servers = registry.read().unwrap();
        assert_eq!(
            servers,
            vec![
                ServerAddr::new("a", 1),
                ServerAddr::new("b", 2),
                ServerAddr::new("c", 3),
            ]
        );
    }

    #[test]
    fn missing_registry_is_empty_pool() {
        let tmp = TempDir::new().unwrap();
        let registry = ShardRegistry::new(tmp.path().join("nope.txt"));
        assert!(registry.read().unwrap().is_empty());
    }

    #[test]
    fn bind_persists_and_reuses_choice() {
        let tmp = TempDir::new().unwrap();
        let registry = ShardRegistry::new(tmp.path().join("all_servers.txt"));
        registry.register(&ServerAddr::new("a", 1)).unwrap();
        registry.register(&ServerAddr::new("b", 2)).unwrap();

        let binding = LocalBinding::new(tmp.path().join("state"));
        let first = binding.bind(&registry).unwrap();
        for _ in 0..5 {
            assert_eq!(binding.bind(&registry).unwrap(), first);
        }
    }

    #[test]
    fn stale_binding_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let registry = ShardRegistry::new(tmp.path().join("all_servers.txt"));
        registry.register(&ServerAddr::new("current", 1)).unwrap();

        let state = tmp.path().join("state");
        fs::create_dir_all(&state).unwrap();
        fs::write(state.join("server.txt"), "departed 9").unwrap();

        let binding = LocalBinding::new(&state);
        assert_eq!(binding.bind(&registry).unwrap(), ServerAddr::new("current", 1));
    }

    #[test]
    fn bind_requires_servers() {
        let tmp = TempDir::new().unwrap();
        let registry = ShardRegistry::new(tmp.path().join("all_servers.txt"));
        let binding = LocalBinding::new(tmp.path().join("state"));
        assert!(matches!(binding.bind(&registry), Err(StoreError::NoServers)));
    }
}
