//! Core value types shared across the workflow engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Canonical Enums (used across all crates)
// ============================================================================

/// Terminal status of a single simulation, derived from its signal flags.
/// This is the CANONICAL definition - use this everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SimulationStatus {
    /// Neither flag present: the simulation continues (or restarts).
    #[default]
    Unknown,
    /// The simulation published its success flag.
    Success,
    /// The simulation published its failure flag (do not restart).
    Failed,
}

impl SimulationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationStatus::Unknown => "unknown",
            SimulationStatus::Success => "success",
            SimulationStatus::Failed => "failed",
        }
    }

    /// Success or Failed; Unknown sims keep their resources.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SimulationStatus::Unknown)
    }
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The pipeline stages a tracker can drive. The ordered set is closed;
/// succession between stages is declared by [`JobType::next_queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    #[serde(rename = "createsim")]
    CreateSim,
    Cg,
    Backmapping,
    Aa,
}

impl JobType {
    pub const ALL: &'static [JobType] = &[
        JobType::CreateSim,
        JobType::Cg,
        JobType::Backmapping,
        JobType::Aa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CreateSim => "createsim",
            JobType::Cg => "cg",
            JobType::Backmapping => "backmapping",
            JobType::Aa => "aa",
        }
    }

    /// The queue a successful simulation graduates into, if any.
    pub fn next_queue(&self) -> Option<JobType> {
        match self {
            JobType::CreateSim => Some(JobType::Cg),
            JobType::Backmapping => Some(JobType::Aa),
            JobType::Cg | JobType::Aa => None,
        }
    }

    /// Fixed per-type marker filenames: `(success, failure)`.
    pub fn status_flags(&self) -> (&'static str, &'static str) {
        match self {
            JobType::CreateSim => ("createsims_success", "createsims_failure"),
            JobType::Cg => ("cg_success", "cg_failure"),
            JobType::Backmapping => ("backmapping_success", "backmapping_failure"),
            JobType::Aa => ("aa_success", "aa_failure"),
        }
    }

    /// Default workdir family for simulations of this type. Setup stages
    /// write into the directory of the stage they prepare.
    pub fn sim_dir_key(&self) -> &'static str {
        match self {
            JobType::CreateSim | JobType::Cg => "cg",
            JobType::Backmapping | JobType::Aa => "aa",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "createsim" => Ok(JobType::CreateSim),
            "cg" => Ok(JobType::Cg),
            "backmapping" => Ok(JobType::Backmapping),
            "aa" => Ok(JobType::Aa),
            _ => Err(JobTypeError::Unknown(s.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobTypeError {
    #[error("unknown job type: '{0}'")]
    Unknown(String),
}

// ============================================================================
// Job identity
// ============================================================================

/// Canonical job identifier across the system.
///
/// Assigned by the scheduler adapter on submission; synthetic (UUID hex)
/// when scheduling is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Job
// ============================================================================

/// One scheduler unit: a bundle of simulations co-scheduled as a single job.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_type: JobType,
    pub id: JobId,
    pub sims: Vec<String>,
}

impl Job {
    pub fn new(job_type: JobType, id: JobId, sims: Vec<String>) -> Self {
        debug_assert!(!sims.is_empty(), "a job carries at least one simulation");
        Self { job_type, id, sims }
    }

    pub fn len(&self) -> usize {
        self.sims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sims.is_empty()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job[{}]: id = {}, sims = {:?}",
            self.job_type, self.id, self.sims
        )
    }
}
