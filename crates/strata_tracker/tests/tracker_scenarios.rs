//! End-to-end tracker scenarios against a mock scheduler adapter.

use anyhow::{bail, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use strata_protocol::{HostResources, JobId, JobSpec, NamingContext};
use strata_store::send_signal;
use strata_tracker::{
    CancelCode, JobState, JobTracker, LaunchStep, SchedulerAdapter, StatusCode, TrackerState,
};
use tempfile::TempDir;

// ----------------------------------------------------------------------
// Mock adapter
// ----------------------------------------------------------------------

struct MockState {
    next_id: u64,
    states: HashMap<JobId, JobState>,
    code: StatusCode,
    cancelled: Vec<JobId>,
    fail_sims: HashSet<String>,
}

struct MockAdapter {
    inner: Mutex<MockState>,
}

impl MockAdapter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MockState {
                next_id: 0,
                states: HashMap::new(),
                code: StatusCode::Ok,
                cancelled: Vec::new(),
                fail_sims: HashSet::new(),
            }),
        })
    }

    fn set_state(&self, id: &JobId, state: JobState) {
        self.inner.lock().unwrap().states.insert(id.clone(), state);
    }

    fn set_all_states(&self, state: JobState) {
        let mut inner = self.inner.lock().unwrap();
        for value in inner.states.values_mut() {
            *value = state;
        }
    }

    fn set_code(&self, code: StatusCode) {
        self.inner.lock().unwrap().code = code;
    }

    fn fail_submissions_containing(&self, sim: &str) {
        self.inner.lock().unwrap().fail_sims.insert(sim.to_string());
    }

    fn cancelled(&self) -> Vec<JobId> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    fn preset_state(&self, id: &str, state: JobState) {
        self.set_state(&JobId::new(id), state);
    }
}

impl SchedulerAdapter for MockAdapter {
    fn write_script(&self, workspace: &Path, step: &LaunchStep) -> Result<PathBuf> {
        let path = workspace.join(format!("{}.sh", step.name));
        std::fs::write(&path, &step.command)?;
        Ok(path)
    }

    fn submit(&self, step: &LaunchStep, _script: &Path, _workspace: &Path) -> Result<JobId> {
        let mut inner = self.inner.lock().unwrap();
        for sim in &inner.fail_sims {
            if step.name.contains(sim.as_str()) {
                bail!("scheduler rejected step {}", step.name);
            }
        }
        inner.next_id += 1;
        let id = JobId::new(format!("J{}", inner.next_id));
        inner.states.insert(id.clone(), JobState::Running);
        Ok(id)
    }

    fn check_jobs(&self, ids: &[JobId]) -> Result<(StatusCode, HashMap<JobId, JobState>)> {
        let inner = self.inner.lock().unwrap();
        let states = ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    inner.states.get(id).copied().unwrap_or(JobState::NotFound),
                )
            })
            .collect();
        Ok((inner.code, states))
    }

    fn cancel_jobs(&self, ids: &[JobId]) -> CancelCode {
        let mut inner = self.inner.lock().unwrap();
        for id in ids {
            inner.states.insert(id.clone(), JobState::Cancelled);
            inner.cancelled.push(id.clone());
        }
        CancelCode::Ok
    }
}

// ----------------------------------------------------------------------
// Fixture
// ----------------------------------------------------------------------

struct Fixture {
    _tmp: TempDir,
    naming: NamingContext,
    adapter: Arc<MockAdapter>,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let naming = NamingContext::with_resources(
            tmp.path().join("campaign"),
            HostResources { cores_per_node: 42, gpus_per_node: 4 },
        )
        .unwrap();
        naming.create_root().unwrap();
        Self { _tmp: tmp, naming, adapter: MockAdapter::new() }
    }

    fn spec(&self, cores_per_task: u32, bundle_size: usize) -> JobSpec {
        serde_yaml::from_str(&format!(
            r#"
job_type: cg
jobname: cg
jobdesc: "cg sim {{}}"
script: "run_sim --name {{simname}}"
config:
  nnodes: 1
  nprocs: 1
  cores_per_task: {cores_per_task}
  ngpus: 0
  bundle_size: {bundle_size}
"#
        ))
        .unwrap()
    }

    fn tracker(&self, total_nodes: u32, cores_per_task: u32) -> JobTracker {
        JobTracker::new(
            self.spec(cores_per_task, 1),
            total_nodes,
            self.naming.clone(),
            self.adapter.clone(),
            true,
        )
        .unwrap()
    }

    fn make_simdir(&self, sim: &str) -> PathBuf {
        self.naming.create_simdir("cg", sim).unwrap()
    }

    fn write_flag(&self, sim: &str, flag: &str) {
        let dir = self.make_simdir(sim);
        send_signal(&dir, flag).unwrap();
    }

    fn journal_events(&self) -> Vec<(String, String, String)> {
        let path = self
            .naming
            .dir_root("workspace")
            .unwrap()
            .join("jobtracker.history.csv");
        let mut reader = csv_reader(&path);
        reader
            .records()
            .map(|r| {
                let r = r.unwrap();
                (r[2].to_string(), r[3].to_string(), r[6].to_string())
            })
            .collect()
    }
}

fn csv_reader(path: &Path) -> csv::Reader<std::fs::File> {
    csv::ReaderBuilder::new().from_path(path).unwrap()
}

fn names(sims: &[&str]) -> Vec<String> {
    sims.iter().map(|s| s.to_string()).collect()
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

/// Bundle-size-1 happy path: two of three sims start, journal records the
/// queue additions and starts.
#[test]
fn bundle_size_one_happy_path() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    tracker.enqueue(&names(&["a", "b", "c"]), false).unwrap();
    let (started, sims) = tracker.start_jobs(2).unwrap();

    assert_eq!(started, 2);
    assert_eq!(sims, names(&["a", "b"]));
    assert_eq!(tracker.nrunning_jobs(), 2);
    assert_eq!(tracker.status().queued, names(&["c"]));

    let events = fx.journal_events();
    let appended: Vec<_> = events.iter().filter(|(e, _, _)| e == "appended_to_queue").collect();
    let started_rows: Vec<_> = events.iter().filter(|(e, _, _)| e == "started").collect();
    assert_eq!(appended.len(), 3);
    assert_eq!(started_rows.len(), 2);
}

/// Success and failure flags classify a finished pair of jobs.
#[test]
fn update_classifies_flags() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    tracker.enqueue(&names(&["a", "b", "c"]), false).unwrap();
    tracker.start_jobs(2).unwrap();

    fx.write_flag("a", "cg_success");
    fx.write_flag("b", "cg_failure");
    fx.adapter.set_all_states(JobState::Finished);

    let (successes, failures) = tracker.update().unwrap();
    assert_eq!(successes, names(&["a"]));
    assert_eq!(failures, names(&["b"]));
    assert_eq!(tracker.nrunning_jobs(), 0);
    assert_eq!(tracker.status().queued, names(&["c"]));

    let events = fx.journal_events();
    assert!(events.iter().any(|(e, id, _)| e == "found_success" && id == "a"));
    assert!(events.iter().any(|(e, id, _)| e == "found_failed" && id == "b"));
}

/// A job that ended without publishing any flag requeues its sim at the
/// head and reports nothing terminal.
#[test]
fn ended_job_without_flag_is_requeued() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    fx.make_simdir("a");
    tracker.enqueue(&names(&["a"]), false).unwrap();
    tracker.start_jobs(1).unwrap();

    fx.adapter.set_all_states(JobState::Finished);
    let (successes, failures) = tracker.update().unwrap();

    assert!(successes.is_empty());
    assert!(failures.is_empty());
    assert_eq!(tracker.nrunning_jobs(), 0);
    assert_eq!(tracker.status().queued, names(&["a"]));

    let events = fx.journal_events();
    assert!(events
        .iter()
        .any(|(e, id, _)| e == "prepended_to_queue" && id == "a"));
}

/// Re-enqueueing a queued sim is a no-op with exactly one rejected row.
#[test]
fn duplicate_enqueue_is_rejected() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    tracker.enqueue(&names(&["a"]), false).unwrap();
    let added = tracker.enqueue(&names(&["a", "d"]), false).unwrap();

    assert_eq!(added, names(&["d"]));
    assert_eq!(tracker.status().queued, names(&["a", "d"]));

    let events = fx.journal_events();
    let rejected: Vec<_> = events.iter().filter(|(e, _, _)| e == "rejected").collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].1, "a");
    assert_eq!(rejected[0].2, "add_to_queue:already_queued");
}

/// A running sim is also rejected on enqueue.
#[test]
fn running_sims_are_rejected_on_enqueue() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    tracker.enqueue(&names(&["a"]), false).unwrap();
    tracker.start_jobs(1).unwrap();
    let added = tracker.enqueue(&names(&["a", "e"]), false).unwrap();

    assert_eq!(added, names(&["e"]));
    let events = fx.journal_events();
    assert!(events
        .iter()
        .any(|(e, id, c)| e == "rejected" && id == "a" && c == "add_to_queue:already_running"));
}

/// Restore re-attaches a still-alive job and queues the checkpointed queue.
#[test]
fn restore_reattaches_live_jobs() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    fx.make_simdir("x");
    fx.make_simdir("y");
    fx.adapter.preset_state("J1", JobState::Running);

    let state = TrackerState {
        job_type: strata_protocol::JobType::Cg,
        job_cnt: 0,
        queued: names(&["x"]),
        running: BTreeMap::from([("J1".to_string(), names(&["y"]))]),
        ts: None,
    };
    let (successes, failures) = tracker.restore(state, true).unwrap();

    assert!(successes.is_empty());
    assert!(failures.is_empty());
    assert_eq!(tracker.nrunning_jobs(), 1);
    let status = tracker.status();
    assert_eq!(status.running.get("J1"), Some(&names(&["y"])));
    assert_eq!(status.queued, names(&["x"]));
}

/// Restore funnels a dead flagless job back to the queue head.
#[test]
fn restore_requeues_dead_jobs() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    fx.make_simdir("x");
    fx.make_simdir("y");
    fx.adapter.preset_state("J1", JobState::NotFound);

    let state = TrackerState {
        job_type: strata_protocol::JobType::Cg,
        job_cnt: 0,
        queued: names(&["x"]),
        running: BTreeMap::from([("J1".to_string(), names(&["y"]))]),
        ts: None,
    };
    let (successes, failures) = tracker.restore(state, true).unwrap();

    assert!(successes.is_empty());
    assert!(failures.is_empty());
    assert_eq!(tracker.nrunning_jobs(), 0);
    assert_eq!(tracker.status().queued, names(&["y", "x"]));
}

/// A checkpointed sim with no workdir fails the restore after journaling.
#[test]
fn restore_rejects_missing_setup() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    let state = TrackerState {
        job_type: strata_protocol::JobType::Cg,
        job_cnt: 0,
        queued: names(&["ghost"]),
        running: BTreeMap::new(),
        ts: None,
    };
    assert!(tracker.restore(state, true).is_err());

    let events = fx.journal_events();
    assert!(events
        .iter()
        .any(|(e, id, c)| e == "rejected" && id == "ghost" && c == "restore:incorrect_setup/queued"));
}

/// Resource ceiling: three nodes at one bundle per node start exactly three
/// jobs no matter how many are requested.
#[test]
fn resource_ceiling_limits_starts() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(3, 42);
    assert_eq!(tracker.max_jobs_total(), 3);

    let sims: Vec<String> = (0..10).map(|i| format!("sim_{i:02}")).collect();
    tracker.enqueue(&sims, false).unwrap();
    let (started, _) = tracker.start_jobs(100).unwrap();

    assert_eq!(started, 3);
    assert_eq!(tracker.nrunning_jobs(), 3);
    assert_eq!(tracker.nqueued_sims(), 7);
    // Saturated: a further call starts nothing.
    assert_eq!(tracker.start_jobs(100).unwrap().0, 0);
}

/// Scheduler uncertainty never reclaims resources.
#[test]
fn unusable_scheduler_answer_leaves_running_intact() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    tracker.enqueue(&names(&["a"]), false).unwrap();
    tracker.start_jobs(1).unwrap();

    fx.adapter.set_code(StatusCode::Error);
    let (successes, failures) = tracker.update().unwrap();
    assert!(successes.is_empty() && failures.is_empty());
    assert_eq!(tracker.nrunning_jobs(), 1);

    fx.adapter.set_code(StatusCode::NoJobs);
    tracker.update().unwrap();
    assert_eq!(tracker.nrunning_jobs(), 1);
}

/// A live job whose only sim failed is cancelled and reclaimed.
#[test]
fn live_job_with_failed_sim_is_cancelled() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    tracker.enqueue(&names(&["a"]), false).unwrap();
    tracker.start_jobs(1).unwrap();
    fx.write_flag("a", "cg_failure");

    let (successes, failures) = tracker.update().unwrap();
    assert!(successes.is_empty());
    assert_eq!(failures, names(&["a"]));
    assert_eq!(tracker.nrunning_jobs(), 0);
    assert_eq!(fx.adapter.cancelled().len(), 1);
}

/// A timed-out job marks its sims failed even without a failure flag.
#[test]
fn timeout_overrides_missing_flags() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    fx.make_simdir("a");
    tracker.enqueue(&names(&["a"]), false).unwrap();
    tracker.start_jobs(1).unwrap();
    fx.adapter.set_all_states(JobState::Timedout);

    let (successes, failures) = tracker.update().unwrap();
    assert!(successes.is_empty());
    assert_eq!(failures, names(&["a"]));
    assert_eq!(tracker.nrunning_jobs(), 0);
}

/// A failed submission surfaces as an error, keeps the other bundle
/// running, and returns the failed bundle to the queue head.
#[test]
fn submit_failure_requeues_and_surfaces() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    fx.adapter.fail_submissions_containing("b");
    tracker.enqueue(&names(&["a", "b"]), false).unwrap();

    let err = tracker.start_jobs(2).unwrap_err();
    assert!(format!("{err:#}").contains("failed to submit"));
    assert_eq!(tracker.nrunning_jobs(), 1);
    assert_eq!(tracker.status().queued, names(&["b"]));
}

/// Checkpoint and reload preserve queue and running sets.
#[test]
fn checkpoint_roundtrip() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);

    tracker.enqueue(&names(&["a", "b", "c"]), false).unwrap();
    tracker.start_jobs(1).unwrap();

    let path = fx.naming.dir_root("workspace").unwrap().join("tracker.cg.yaml");
    tracker.checkpoint(&path).unwrap();

    let state = TrackerState::load(&path).unwrap().unwrap();
    assert_eq!(state.job_type, strata_protocol::JobType::Cg);
    assert_eq!(state.queued, names(&["b", "c"]));
    assert_eq!(state.running.len(), 1);
    assert_eq!(state.running.values().next().unwrap(), &names(&["a"]));
    assert!(state.ts.is_some());
}

/// Status snapshots serialize with the external field names.
#[test]
fn status_snapshot_shape() {
    let fx = Fixture::new();
    let mut tracker = fx.tracker(1, 1);
    tracker.enqueue(&names(&["a"]), false).unwrap();

    let status = tracker.status();
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["type"], "cg");
    assert_eq!(json["nqueued"], 1);
    assert_eq!(json["nrunning"], 0);
}
