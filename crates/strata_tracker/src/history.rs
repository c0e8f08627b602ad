//! Append-only history journal.
//!
//! Every queue and classification transition lands as one CSV row per
//! simulation touched. The header is written only when the file does not
//! exist yet, so journals survive process restarts intact.

use anyhow::{Context, Result};
use chrono::Local;
use std::fs::OpenOptions;
use std::path::PathBuf;
use strata_protocol::JobType;

const HEADER: [&str; 7] = [
    "tstamp",
    "job_type",
    "event",
    "id",
    "nrunning",
    "nqueued",
    "comments",
];

/// Journaled event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEvent {
    AppendedToQueue,
    PrependedToQueue,
    Rejected,
    Started,
    FoundSuccess,
    FoundFailed,
    Restore,
    Restored,
}

impl HistoryEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryEvent::AppendedToQueue => "appended_to_queue",
            HistoryEvent::PrependedToQueue => "prepended_to_queue",
            HistoryEvent::Rejected => "rejected",
            HistoryEvent::Started => "started",
            HistoryEvent::FoundSuccess => "found_success",
            HistoryEvent::FoundFailed => "found_failed",
            HistoryEvent::Restore => "restore",
            HistoryEvent::Restored => "restored",
        }
    }
}

/// One tracker's journal file.
#[derive(Debug, Clone)]
pub struct HistoryJournal {
    path: PathBuf,
    job_type: JobType,
}

impl HistoryJournal {
    pub fn new(path: impl Into<PathBuf>, job_type: JobType) -> Self {
        Self { path: path.into(), job_type }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one row per entry. Empty batches write nothing.
    pub fn record(
        &self,
        event: HistoryEvent,
        entries: &[String],
        nrunning: usize,
        nqueued: usize,
        comments: &str,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let write_header = !self.path.is_file();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open journal {}", self.path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if write_header {
            writer.write_record(HEADER)?;
        }

        let ts = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let nrunning = nrunning.to_string();
        let nqueued = nqueued.to_string();
        for entry in entries {
            writer.write_record([
                ts.as_str(),
                self.job_type.as_str(),
                event.as_str(),
                entry.as_str(),
                nrunning.as_str(),
                nqueued.as_str(),
                comments,
            ])?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to flush journal {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_rows(journal: &HistoryJournal) -> Vec<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(journal.path())
            .unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn header_written_once() {
        let tmp = TempDir::new().unwrap();
        let journal = HistoryJournal::new(tmp.path().join("history.csv"), JobType::Cg);

        journal
            .record(HistoryEvent::AppendedToQueue, &["a".to_string()], 0, 1, "add_to_queue")
            .unwrap();
        journal
            .record(HistoryEvent::Started, &["a".to_string()], 1, 0, "start_jobs")
            .unwrap();

        let rows = read_rows(&journal);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0], "tstamp");
        assert_eq!(rows[1][2], "appended_to_queue");
        assert_eq!(rows[2][2], "started");
        assert_eq!(rows[2][1], "cg");
    }

    #[test]
    fn empty_batches_write_nothing() {
        let tmp = TempDir::new().unwrap();
        let journal = HistoryJournal::new(tmp.path().join("history.csv"), JobType::Cg);
        journal
            .record(HistoryEvent::Rejected, &[], 0, 0, "noop")
            .unwrap();
        assert!(!journal.path().is_file());
    }

    #[test]
    fn one_row_per_sim() {
        let tmp = TempDir::new().unwrap();
        let journal = HistoryJournal::new(tmp.path().join("history.csv"), JobType::Aa);
        journal
            .record(
                HistoryEvent::FoundFailed,
                &["x".to_string(), "y".to_string()],
                2,
                3,
                "update",
            )
            .unwrap();

        let rows = read_rows(&journal);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][3], "x");
        assert_eq!(rows[2][3], "y");
        assert_eq!(rows[1][4], "2");
        assert_eq!(rows[1][5], "3");
    }
}
