//! Shared tracing setup for Strataflow processes.
//!
//! Log lines go to a size-capped rolling file under the campaign log
//! directory and, at a separately filtered level, to stderr. `RUST_LOG`
//! overrides the default filter.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "strata=info,strata_store=info,strata_tracker=info";
const MAX_ROTATIONS: usize = 5;
const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Logging configuration for one process.
pub struct LogConfig<'a> {
    /// Name of the log file stem, e.g. `workflow`.
    pub app_name: &'a str,
    /// Directory for log files; defaults to `{home}/logs`.
    pub log_dir: Option<PathBuf>,
    /// Mirror the file-level filter on stderr instead of warnings only.
    pub verbose: bool,
}

/// Home directory for Strataflow state: `$STRATA_HOME` or `~/.strataflow`.
pub fn strata_home() -> PathBuf {
    if let Ok(home) = std::env::var("STRATA_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".strataflow")
}

/// Default log directory, created on demand.
pub fn logs_dir() -> PathBuf {
    strata_home().join("logs")
}

/// Install the global subscriber: rolling file layer plus stderr layer.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let dir = config.log_dir.unwrap_or_else(logs_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let writer = RollingWriter::open(dir, config.app_name)
        .context("Failed to open rolling log file")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

struct RollingFile {
    dir: PathBuf,
    stem: String,
    file: File,
    written: u64,
}

impl RollingFile {
    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    fn rotation_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.stem, index))
    }

    /// Shift `name.log` -> `name.log.1` -> ... and reopen a fresh file.
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let oldest = self.rotation_path(MAX_ROTATIONS - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..MAX_ROTATIONS - 1).rev() {
            let src = self.rotation_path(index);
            if src.exists() {
                fs::rename(&src, self.rotation_path(index + 1))?;
            }
        }
        let active = self.active_path();
        if active.exists() {
            fs::rename(&active, self.rotation_path(1))?;
        }

        self.file = OpenOptions::new().create(true).append(true).open(active)?;
        self.written = 0;
        Ok(())
    }
}

/// Cloneable writer handle handed to `tracing_subscriber`.
#[derive(Clone)]
pub struct RollingWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl RollingWriter {
    fn open(dir: PathBuf, stem: &str) -> io::Result<Self> {
        let stem: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();

        let path = dir.join(format!("{stem}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        let mut inner = RollingFile { dir, stem, file, written };
        if inner.written > MAX_FILE_BYTES {
            inner.rotate()?;
        }
        Ok(Self { inner: Arc::new(Mutex::new(inner)) })
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        if inner.written + buf.len() as u64 > MAX_FILE_BYTES {
            inner.rotate()?;
        }
        let n = inner.file.write(buf)?;
        inner.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        inner.file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RollingWriter {
    type Writer = RollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writer_appends_and_rotates() {
        let tmp = TempDir::new().unwrap();
        let mut writer = RollingWriter::open(tmp.path().to_path_buf(), "test-app").unwrap();

        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();
        assert!(tmp.path().join("test-app.log").is_file());

        // Force a rotation by exceeding the cap in one shot.
        {
            let mut inner = writer.inner.lock().unwrap();
            inner.written = MAX_FILE_BYTES;
        }
        writer.write_all(b"world\n").unwrap();
        writer.flush().unwrap();
        assert!(tmp.path().join("test-app.log.1").is_file());
    }

    #[test]
    fn stem_is_sanitized() {
        let tmp = TempDir::new().unwrap();
        let _writer = RollingWriter::open(tmp.path().to_path_buf(), "a/b c").unwrap();
        assert!(tmp.path().join("a_b_c.log").is_file());
    }
}
