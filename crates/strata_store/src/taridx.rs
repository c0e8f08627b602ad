//! Append-only tar backend with a sidecar index.
//!
//! A namespace is a `.tar` archive plus a text sidecar (`.tar.lst`) of
//! `key,offset,length` rows. The sidecar is streaming-readable and append
//! mirrors the archive: every save extends both. Lookups go through an
//! in-memory B-tree built from the sidecar, keeping the last occurrence of
//! duplicated keys. Removal and renames are unsupported; a corrupt or
//! missing sidecar is recovered with [`TarStore::rebuild_index`].

use crate::backend::{check_extn, BackendKind, ObjectStore, Payload, StoreError, StoreResult};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::{debug, info};

const BLOCK: u64 = 512;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    length: u64,
}

impl IndexEntry {
    /// Archive bytes consumed by this member's data, padded to a block.
    fn padded_end(&self) -> u64 {
        self.offset + self.length.div_ceil(BLOCK) * BLOCK
    }
}

#[derive(Debug, Default)]
pub struct TarStore;

impl TarStore {
    pub fn new() -> Self {
        Self
    }

    fn tar_path(namespace: &str) -> PathBuf {
        PathBuf::from(check_extn(namespace, ".tar"))
    }

    fn sidecar_path(namespace: &str) -> PathBuf {
        let mut s = Self::tar_path(namespace).into_os_string();
        s.push(".lst");
        PathBuf::from(s)
    }

    /// Read the sidecar into a key-ordered lookup, keeping the last
    /// occurrence of each key. `None` means the namespace holds nothing yet;
    /// a tar without a readable sidecar is corrupt until reindexed.
    fn read_index(namespace: &str) -> StoreResult<Option<BTreeMap<String, IndexEntry>>> {
        let tar_path = Self::tar_path(namespace);
        let sidecar = Self::sidecar_path(namespace);

        if !tar_path.is_file() && !sidecar.is_file() {
            return Ok(None);
        }
        if !sidecar.is_file() {
            return Err(StoreError::Corrupt(format!(
                "missing index sidecar ({}); run rebuild_index",
                sidecar.display()
            )));
        }

        let mut index = BTreeMap::new();
        let reader = BufReader::new(File::open(&sidecar)?);
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = Self::parse_line(&line).ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "bad index row {} in ({}); run rebuild_index",
                    lineno + 1,
                    sidecar.display()
                ))
            })?;
            index.insert(entry.0, entry.1);
        }
        Ok(Some(index))
    }

    /// Rows are `key,offset,length`; keys may themselves contain commas.
    fn parse_line(line: &str) -> Option<(String, IndexEntry)> {
        let mut fields = line.rsplitn(3, ',');
        let length = fields.next()?.trim().parse().ok()?;
        let offset = fields.next()?.trim().parse().ok()?;
        let key = fields.next()?.to_string();
        Some((key, IndexEntry { offset, length }))
    }

    /// Reconstruct the sidecar by scanning the archive itself.
    pub fn rebuild_index(&self, namespace: &str) -> StoreResult<usize> {
        let tar_path = Self::tar_path(namespace);
        let sidecar = Self::sidecar_path(namespace);
        if !tar_path.is_file() {
            return Ok(0);
        }

        info!("Regenerating index for ({})", tar_path.display());
        let mut archive = tar::Archive::new(File::open(&tar_path)?);
        let mut rows = String::new();
        let mut count = 0;
        for entry in archive.entries()? {
            let entry = entry?;
            let key = entry.path()?.to_string_lossy().into_owned();
            rows.push_str(&format!(
                "{},{},{}\n",
                key,
                entry.raw_file_position(),
                entry.size()
            ));
            count += 1;
        }
        fs::write(&sidecar, rows)?;
        info!("Regenerated index for ({}): {} entries", tar_path.display(), count);
        Ok(count)
    }
}

impl ObjectStore for TarStore {
    fn kind(&self) -> BackendKind {
        BackendKind::TarIndex
    }

    fn check_environment(&self) -> StoreResult<()> {
        Ok(())
    }

    fn file_exists(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        match Self::read_index(namespace)? {
            Some(index) => Ok(index.contains_key(key)),
            None => Ok(false),
        }
    }

    fn namespace_exists(&self, namespace: &str) -> StoreResult<bool> {
        Ok(Self::tar_path(namespace).is_file() && Self::sidecar_path(namespace).is_file())
    }

    fn list_keys(&self, namespace: &str, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| StoreError::Corrupt(format!("bad key pattern ({pattern}): {e}")))?;
        let index = match Self::read_index(namespace)? {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };
        Ok(index
            .keys()
            .filter(|k| matcher.matches(k))
            .cloned()
            .collect())
    }

    fn load_files(&self, namespace: &str, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        let index = match Self::read_index(namespace)? {
            Some(index) => index,
            None => return Ok(vec![None; keys.len()]),
        };

        // Verify every key before extracting any: all-or-nothing view.
        for key in keys {
            if !index.contains_key(key) {
                debug!("File ({}) does not exist in ({})", key, namespace);
                return Ok(vec![None; keys.len()]);
            }
        }

        let mut file = File::open(Self::tar_path(namespace))?;
        let mut data = Vec::with_capacity(keys.len());
        for key in keys {
            let entry = index[key];
            file.seek(SeekFrom::Start(entry.offset))?;
            let mut buf = vec![0u8; entry.length as usize];
            file.read_exact(&mut buf)?;
            data.push(Some(buf));
        }
        Ok(data)
    }

    fn save_files(&self, namespace: &str, keys: &[String], data: &[Payload]) -> StoreResult<()> {
        debug_assert_eq!(keys.len(), data.len());
        debug!("Writing {} files to ({})", keys.len(), namespace);

        let tar_path = Self::tar_path(namespace);
        if let Some(parent) = tar_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Resume writing where the member data ends; the archive trailer
        // past that point gets overwritten by the new members.
        let data_end = Self::read_index(namespace)?
            .map(|index| index.values().map(IndexEntry::padded_end).max().unwrap_or(0))
            .unwrap_or(0);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&tar_path)?;
        file.seek(SeekFrom::Start(data_end))?;

        let mtime = Utc::now().timestamp().max(0) as u64;
        let mut builder = tar::Builder::new(file);
        let mut rows = String::new();
        for (key, payload) in keys.iter().zip(data) {
            let bytes = payload.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(mtime);
            builder.append_data(&mut header, key, bytes)?;

            // Position after the padded data gives the member's data offset
            // without assuming anything about long-name extension headers.
            let pos = builder.get_mut().stream_position()?;
            let padded = (bytes.len() as u64).div_ceil(BLOCK) * BLOCK;
            rows.push_str(&format!("{},{},{}\n", key, pos - padded, bytes.len()));
        }
        builder.into_inner()?;

        let mut sidecar = OpenOptions::new()
            .append(true)
            .create(true)
            .open(Self::sidecar_path(namespace))?;
        sidecar.write_all(rows.as_bytes())?;

        info!("Wrote {} files to ({})", keys.len(), namespace);
        Ok(())
    }

    fn remove_files(&self, _namespace: &str, _keys: &[String]) -> StoreResult<usize> {
        Err(StoreError::Unsupported {
            backend: BackendKind::TarIndex,
            op: "remove_files",
        })
    }

    fn move_key(&self, _namespace: &str, _old: &str, _new: &str) -> StoreResult<()> {
        Err(StoreError::Unsupported {
            backend: BackendKind::TarIndex,
            op: "move_key",
        })
    }
}
