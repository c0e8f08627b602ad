//! Per-job-type workflow controller for Strataflow.
//!
//! The tracker drives one job type end to end: queueing simulations,
//! bundling them into scheduler jobs, reconciling scheduler state with
//! per-simulation signal flags, journaling every transition, and restoring
//! from checkpoints. Scheduler access goes through the injected
//! [`SchedulerAdapter`]; the feedback aggregation contract rides along for
//! downstream crates.

pub mod adapter;
pub mod command;
pub mod feedback;
pub mod history;
pub mod tracker;

pub use adapter::{CancelCode, JobState, LaunchStep, SchedulerAdapter, StatusCode};
pub use command::ScriptRenderer;
pub use feedback::{Feedback, FeedbackContext, FeedbackRole};
pub use history::{HistoryEvent, HistoryJournal};
pub use tracker::{JobTracker, TrackerState, TrackerStatus};
