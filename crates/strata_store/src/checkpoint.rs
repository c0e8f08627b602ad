//! Checkpoint files: structured key-value trees with automatic backups.
//!
//! A checkpoint write first moves any existing file aside to
//! `path.bak[.timestamp]`, then writes the new tree with a mandatory `ts`
//! field. Loads degrade to an empty mapping when the file is absent or
//! unparsable; both cases are diagnosed, not fatal.

use crate::backend::StoreResult;
use chrono::Local;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

const TS_KEY: &str = "ts";
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const BACKUP_TS_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Move `path` aside to `path.bak` (plus `.suffix` when given), if present.
pub fn take_backup(path: &Path, suffix: Option<&str>) -> StoreResult<()> {
    if !path.is_file() {
        return Ok(());
    }

    let mut backup = PathBuf::from(format!("{}.bak", path.display()));
    if let Some(suffix) = suffix {
        backup = PathBuf::from(format!("{}.{}", backup.display(), suffix));
    }
    fs::rename(path, &backup)?;
    info!("Saved backup ({})", backup.display());
    Ok(())
}

/// Write a checkpoint tree, stamping `ts` and backing up any prior file.
/// With `use_tstamp` the backup name carries the timestamp too.
pub fn save_checkpoint(path: &Path, mut data: Mapping, use_tstamp: bool) -> StoreResult<()> {
    let now = Local::now();
    let suffix = use_tstamp.then(|| now.format(BACKUP_TS_FORMAT).to_string());
    take_backup(path, suffix.as_deref())?;

    let stamp = now.format(TS_FORMAT).to_string();
    data.insert(Value::from(TS_KEY), Value::from(stamp.clone()));
    fs::write(path, serde_yaml::to_string(&data)?)?;

    info!("Saved checkpoint file ({}) at {}", path.display(), stamp);
    Ok(())
}

/// Load a checkpoint tree; absent or unparsable files yield an empty
/// mapping.
pub fn load_checkpoint(path: &Path) -> Mapping {
    if !path.is_file() {
        info!("Checkpoint file ({}) does not exist", path.display());
        return Mapping::new();
    }

    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            error!("Checkpoint file ({}) failed to load: {}", path.display(), e);
            return Mapping::new();
        }
    };

    match serde_yaml::from_str::<Mapping>(&contents) {
        Ok(data) => {
            if let Some(ts) = data.get(TS_KEY).and_then(Value::as_str) {
                info!("Restored checkpoint file ({}) from {}", path.display(), ts);
            }
            data
        }
        Err(e) => {
            error!("Checkpoint file ({}) failed to load: {}", path.display(), e);
            Mapping::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_adds_timestamp() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.yaml");

        let mut data = Mapping::new();
        data.insert(Value::from("a"), Value::from(1));
        data.insert(Value::from("b"), Value::from("two"));
        save_checkpoint(&path, data.clone(), false).unwrap();

        let loaded = load_checkpoint(&path);
        assert_eq!(loaded.get("a"), Some(&Value::from(1)));
        assert_eq!(loaded.get("b"), Some(&Value::from("two")));
        assert!(loaded.get("ts").and_then(Value::as_str).is_some());
    }

    #[test]
    fn existing_file_is_backed_up() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.yaml");

        save_checkpoint(&path, Mapping::new(), false).unwrap();
        save_checkpoint(&path, Mapping::new(), false).unwrap();
        assert!(tmp.path().join("state.yaml.bak").is_file());
    }

    #[test]
    fn missing_or_garbled_checkpoint_is_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.yaml");
        assert!(load_checkpoint(&path).is_empty());

        fs::write(&path, ": not : valid : yaml [").unwrap();
        assert!(load_checkpoint(&path).is_empty());
    }
}
