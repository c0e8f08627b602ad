//! Scheduler adapter contract.
//!
//! The tracker never talks to a batch scheduler directly; an injected
//! adapter renders launch scripts, submits them, answers batched state
//! queries, and cancels jobs. The concrete scheduler behind the adapter is
//! irrelevant to the tracker.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use strata_protocol::JobId;

// ============================================================================
// Adapter result codes
// ============================================================================

/// Outcome of a batched state query. Anything but `Ok` means the answer is
/// unusable and the caller must not reclaim resources this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Query answered; per-job states are valid.
    Ok,
    /// Queried, but none of the jobs were found.
    NoJobs,
    /// Could not reach the scheduler.
    Error,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCode {
    Ok,
    Error,
    Unknown,
}

/// Scheduler-side state of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Initialized,
    Pending,
    Waiting,
    Queued,
    Running,
    Finishing,
    Finished,
    Failed,
    Incomplete,
    HwFailure,
    Timedout,
    Cancelled,
    Unknown,
    NotFound,
}

impl JobState {
    /// Active states still hold resources; everything else can be reclaimed.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Initialized
                | JobState::Pending
                | JobState::Waiting
                | JobState::Queued
                | JobState::Running
                | JobState::Finishing
        )
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, JobState::Timedout)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Launch step
// ============================================================================

/// One renderable scheduler unit: the launch description of a single bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchStep {
    pub name: String,
    pub description: String,
    pub command: String,
    pub nodes: u32,
    pub procs: u32,
    pub cores_per_task: u32,
    pub gpus: u32,
    pub walltime: Option<String>,
    pub use_broker: bool,
    pub broker_options: BTreeMap<String, serde_yaml::Value>,
    pub wrapper: Option<String>,
}

// ============================================================================
// Adapter trait
// ============================================================================

/// Driver for one batch scheduler.
pub trait SchedulerAdapter: Send + Sync {
    /// Render the launch script for `step` into the workspace; returns the
    /// script path. Side-effect free with respect to tracker state.
    fn write_script(&self, workspace: &Path, step: &LaunchStep) -> Result<PathBuf>;

    /// Submit a rendered script. The returned identifier is the scheduler's
    /// handle for the whole bundle.
    fn submit(&self, step: &LaunchStep, script: &Path, workspace: &Path) -> Result<JobId>;

    /// Batched state query for all given jobs.
    fn check_jobs(&self, ids: &[JobId]) -> Result<(StatusCode, HashMap<JobId, JobState>)>;

    /// Cancel jobs. Must tolerate already-dead jobs.
    fn cancel_jobs(&self, ids: &[JobId]) -> CancelCode;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states_hold_resources() {
        for state in [
            JobState::Initialized,
            JobState::Pending,
            JobState::Waiting,
            JobState::Queued,
            JobState::Running,
            JobState::Finishing,
        ] {
            assert!(state.is_active(), "{state} should be active");
        }
        for state in [
            JobState::Finished,
            JobState::Failed,
            JobState::Incomplete,
            JobState::HwFailure,
            JobState::Timedout,
            JobState::Cancelled,
            JobState::Unknown,
            JobState::NotFound,
        ] {
            assert!(!state.is_active(), "{state} should be inactive");
        }
    }

    #[test]
    fn only_timedout_reports_timeout() {
        assert!(JobState::Timedout.is_timed_out());
        assert!(!JobState::Failed.is_timed_out());
    }
}
