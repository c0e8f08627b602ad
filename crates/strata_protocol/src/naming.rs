//! Filesystem naming for a campaign root.
//!
//! The naming service is an explicit context object threaded through
//! construction of trackers and stores, not process-global state. It owns
//! the campaign root layout, per-simulation workdirs, and the per-node
//! resource counts resolved from host identity at startup.

use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Environment variables consumed when no explicit paths are given.
pub const ENV_ROOT: &str = "MUMMI_ROOT";
pub const ENV_RESOURCES: &str = "MUMMI_RESOURCES";
pub const ENV_APP: &str = "MUMMI_APP";

/// Directories created under the campaign root. Simulation workdir
/// families (`sims-cg`, `sims-aa`) are resolved through [`NamingContext::dir_sim`].
const ROOT_DIRS: &[&str] = &[
    "workspace",
    "redis",
    "flux",
    "macro",
    "patches",
    "feedback-cg2macro",
    "feedback-aa2cg",
];

/// Per-node capacity, resolved once from host identity and immutable after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub cores_per_node: u32,
    pub gpus_per_node: u32,
}

/// Hostname patterns with known per-node resource counts.
const KNOWN_HOSTS: &[(&str, &str, HostResources)] = &[
    (
        "galaxy*",
        "lassen",
        HostResources { cores_per_node: 42, gpus_per_node: 4 },
    ),
    (
        "*lassen*",
        "lassen",
        HostResources { cores_per_node: 42, gpus_per_node: 4 },
    ),
    (
        "*summit*",
        "summit",
        HostResources { cores_per_node: 42, gpus_per_node: 6 },
    ),
];

/// Resolve per-node resource counts from the current hostname.
///
/// Unrecognized hosts fall back to the logical CPU count and a single GPU,
/// with a diagnostic.
pub fn resolve_host_resources() -> HostResources {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    for (pattern, contracted, res) in KNOWN_HOSTS {
        if let Ok(pat) = glob::Pattern::new(pattern) {
            if pat.matches(&hostname) {
                debug!("Resolved host '{}' as '{}': {:?}", hostname, contracted, res);
                return *res;
            }
        }
    }

    error!("Unidentified hostname: {}", hostname);
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    HostResources { cores_per_node: cores, gpus_per_node: 1 }
}

/// Campaign root context: directory layout plus host capacity.
#[derive(Debug, Clone)]
pub struct NamingContext {
    root: PathBuf,
    resources: Option<PathBuf>,
    specs: Option<PathBuf>,
    host: HostResources,
}

#[derive(Serialize)]
struct RootManifest<'a> {
    created_on: String,
    root: &'a Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    specs: Option<&'a Path>,
}

impl NamingContext {
    /// Build a context rooted at `root`, creating the directory if missing.
    /// Host capacity is resolved from the current hostname.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_resources(root, resolve_host_resources())
    }

    /// Build a context with explicit per-node capacity (tests, overrides).
    pub fn with_resources(root: impl Into<PathBuf>, host: HostResources) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            fs::create_dir_all(&root)
                .with_context(|| format!("Failed to create campaign root {}", root.display()))?;
        }
        Ok(Self { root, resources: None, specs: None, host })
    }

    /// Build a context from the environment (`MUMMI_ROOT`, `MUMMI_RESOURCES`,
    /// `MUMMI_APP`). The resources and specs directories must exist when set.
    pub fn from_env() -> Result<Self> {
        let root = std::env::var(ENV_ROOT)
            .with_context(|| format!("{ENV_ROOT} is not set"))?;
        let mut ctx = Self::new(PathBuf::from(root))?;

        if let Ok(resources) = std::env::var(ENV_RESOURCES) {
            let resources = PathBuf::from(resources);
            if !resources.is_dir() {
                bail!("Resources directory ({}) does not exist", resources.display());
            }
            ctx.resources = Some(resources);
        }

        if let Ok(app) = std::env::var(ENV_APP) {
            let specs = PathBuf::from(app).join("specs");
            if !specs.is_dir() {
                bail!("Specs directory ({}) does not exist", specs.display());
            }
            ctx.specs = Some(specs);
        }

        info!(
            "Initialized campaign context: root = ({})",
            ctx.root.display()
        );
        Ok(ctx)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn host_resources(&self) -> HostResources {
        self.host
    }

    /// Resolve a named directory under the root (`workspace`, `redis`,
    /// `flux`, `macro`, `patches`, `feedback-cg2macro`, `feedback-aa2cg`).
    pub fn dir_root(&self, kind: &str) -> Result<PathBuf> {
        if !ROOT_DIRS.contains(&kind) {
            bail!("Invalid directory name ({kind}) requested");
        }
        Ok(self.root.join(kind))
    }

    /// Workdir of one simulation. `family` selects the workdir tree:
    /// `cg` maps to `sims-cg/<simname>`, `aa` to `sims-aa/<simname>`.
    pub fn dir_sim(&self, family: &str, simname: &str) -> Result<PathBuf> {
        match family {
            "cg" => Ok(self.root.join("sims-cg").join(simname)),
            "aa" => Ok(self.root.join("sims-aa").join(simname)),
            _ => bail!("Invalid simulation workdir family ({family}) requested"),
        }
    }

    /// Path of the shard registry file.
    pub fn shard_registry(&self) -> PathBuf {
        self.root.join("redis").join("all_servers.txt")
    }

    /// Scheduler connection URI, read from `{root}/flux/flux.info`.
    /// Empty result is diagnosed, never fatal.
    pub fn scheduler_uri(&self) -> Option<String> {
        let path = self.root.join("flux").join("flux.info");
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let uri = contents.trim().to_string();
                if uri.is_empty() { None } else { Some(uri) }
            }
            Err(e) => {
                debug!("No scheduler URI at {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Create the root hierarchy and write a `config.yaml` manifest if one
    /// does not exist yet.
    pub fn create_root(&self) -> Result<()> {
        info!("Creating campaign root hierarchy at ({})", self.root.display());

        for kind in ROOT_DIRS {
            let dir = self.root.join(kind);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        for family in ["sims-cg", "sims-aa"] {
            let dir = self.root.join(family);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let manifest_path = self.root.join("config.yaml");
        if !manifest_path.is_file() {
            let manifest = RootManifest {
                created_on: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                root: &self.root,
                resources: self.resources.as_deref(),
                specs: self.specs.as_deref(),
            };
            let payload = serde_yaml::to_string(&manifest)?;
            fs::write(&manifest_path, payload)
                .with_context(|| format!("Failed to write {}", manifest_path.display()))?;
        }
        Ok(())
    }

    /// Create the workdir of one simulation in the given family.
    pub fn create_simdir(&self, family: &str, simname: &str) -> Result<PathBuf> {
        let dir = self.dir_sim(family, simname)?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }
}
