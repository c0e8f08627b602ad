//! Per-job-type workflow controller.
//!
//! One tracker owns the pending queue and the in-flight jobs of a single
//! job type. It bundles queued simulations, renders and submits launch
//! scripts through the scheduler adapter, reconciles scheduler state with
//! the per-simulation signal flags once per tick, and journals every
//! transition. The tracker is single-owner: nothing mutates its state but
//! the control loop driving it.

use crate::adapter::{CancelCode, JobState, LaunchStep, SchedulerAdapter, StatusCode};
use crate::command::ScriptRenderer;
use crate::history::{HistoryEvent, HistoryJournal};
use anyhow::{bail, ensure, Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use strata_protocol::{Job, JobId, JobSpec, JobType, NamingContext, SimulationStatus};
use strata_store::test_signal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded pool for parallel launch-script rendering.
const RENDER_POOL_SIZE: usize = 10;

const HISTORY_FILE: &str = "jobtracker.history.csv";

/// Block SIGTERM/SIGINT in render workers so the control loop owns
/// process lifecycle.
#[cfg(unix)]
fn mask_termination_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn mask_termination_signals() {}

/// Split sims into (success, failed, unknown) by paired statuses.
fn split_by_status(
    sims: &[String],
    statuses: &[SimulationStatus],
) -> (Vec<String>, Vec<String>, Vec<String>) {
    debug_assert_eq!(sims.len(), statuses.len());
    let mut success = Vec::new();
    let mut failed = Vec::new();
    let mut unknown = Vec::new();
    for (sim, status) in sims.iter().zip(statuses) {
        match status {
            SimulationStatus::Success => success.push(sim.clone()),
            SimulationStatus::Failed => failed.push(sim.clone()),
            SimulationStatus::Unknown => unknown.push(sim.clone()),
        }
    }
    (success, failed, unknown)
}

// ============================================================================
// Snapshots
// ============================================================================

/// Structural snapshot for external monitors.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub job_cnt: u64,
    pub nqueued: usize,
    pub nrunning: usize,
    pub queued: Vec<String>,
    pub running: BTreeMap<String, Vec<String>>,
}

/// Checkpointable tracker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerState {
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(rename = "jobCnt", default)]
    pub job_cnt: u64,
    #[serde(default)]
    pub queued: Vec<String>,
    #[serde(default)]
    pub running: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

impl TrackerState {
    /// Read a prior checkpoint; `None` when the file is absent or unusable.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let mapping = strata_store::load_checkpoint(path);
        if mapping.is_empty() {
            return Ok(None);
        }
        let state = serde_yaml::from_value(serde_yaml::Value::Mapping(mapping))
            .with_context(|| format!("Malformed tracker checkpoint {}", path.display()))?;
        Ok(Some(state))
    }
}

// ============================================================================
// JobTracker
// ============================================================================

pub struct JobTracker {
    spec: JobSpec,
    job_type: JobType,
    naming: NamingContext,
    adapter: Arc<dyn SchedulerAdapter>,
    do_scheduling: bool,
    flag_success: &'static str,
    flag_failure: &'static str,
    bundle_size: usize,
    max_jobs_total: usize,
    workspace: PathBuf,
    journal: HistoryJournal,
    /// FIFO of pending simulations; the front is privileged for requeues.
    queued: VecDeque<String>,
    running: HashMap<JobId, Job>,
    /// Monotonic counter backing synthetic ids when scheduling is disabled.
    job_cnt: u64,
}

impl JobTracker {
    pub fn new(
        spec: JobSpec,
        total_nodes: u32,
        naming: NamingContext,
        adapter: Arc<dyn SchedulerAdapter>,
        enable_scheduling: bool,
    ) -> Result<Self> {
        let job_type = spec.job_type;
        let host = naming.host_resources();
        let rc = &spec.config;

        info!(
            "[{}] Initializing JobTracker (assigned nodes = {})",
            job_type, total_nodes
        );
        debug!(
            "[{}] resources available: total_nodes = {}, cores_per_node = {}, gpus_per_node = {}",
            job_type, total_nodes, host.cores_per_node, host.gpus_per_node
        );

        ensure!(total_nodes >= 1, "[{job_type}] need at least one node");
        ensure!(
            rc.nnodes == 1,
            "[{job_type}] multi-node simulations are not supported (nnodes = {})",
            rc.nnodes
        );
        ensure!(
            rc.nprocs >= 1 && rc.nprocs <= host.cores_per_node,
            "[{job_type}] nprocs = {} outside 1..={}",
            rc.nprocs,
            host.cores_per_node
        );
        ensure!(
            rc.cores_per_task >= 1 && rc.cores_per_task <= host.cores_per_node,
            "[{job_type}] cores_per_task = {} outside 1..={}",
            rc.cores_per_task,
            host.cores_per_node
        );
        ensure!(
            rc.ngpus <= host.gpus_per_node,
            "[{job_type}] ngpus = {} exceeds {} per node",
            rc.ngpus,
            host.gpus_per_node
        );
        ensure!(rc.bundle_size >= 1, "[{job_type}] bundle_size must be >= 1");

        let cores_per_job = rc.bundle_size * rc.cores_per_task as usize;
        let gpus_per_job = rc.bundle_size * rc.ngpus as usize;
        debug!(
            "[{}] resources needed: cores_per_job = {}, gpus_per_job = {}",
            job_type, cores_per_job, gpus_per_job
        );

        let mut max_jobs_pernode = host.cores_per_node as usize / cores_per_job;
        if gpus_per_job > 0 {
            max_jobs_pernode = max_jobs_pernode.min(host.gpus_per_node as usize / gpus_per_job);
        }
        ensure!(
            max_jobs_pernode >= 1,
            "[{job_type}] one node cannot fit a single bundle \
             (cores_per_job = {cores_per_job}, gpus_per_job = {gpus_per_job})"
        );
        let max_jobs_total = total_nodes as usize * max_jobs_pernode;
        debug!("[{}] max_jobs_total = {}", job_type, max_jobs_total);

        // Fail construction on an unusable workdir family or script scope.
        naming.dir_sim(spec.sim_dir_family(), "")?;
        ScriptRenderer::new(&spec)?;

        let workspace = naming.dir_root("workspace")?;
        fs::create_dir_all(&workspace)
            .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;
        let journal = HistoryJournal::new(workspace.join(HISTORY_FILE), job_type);

        let (flag_success, flag_failure) = job_type.status_flags();
        debug!(
            "[{}] status flags: ({})({})",
            job_type, flag_success, flag_failure
        );

        let tracker = Self {
            bundle_size: rc.bundle_size,
            spec,
            job_type,
            naming,
            adapter,
            do_scheduling: enable_scheduling,
            flag_success,
            flag_failure,
            max_jobs_total,
            workspace,
            journal,
            queued: VecDeque::new(),
            running: HashMap::new(),
            job_cnt: 0,
        };
        info!(
            "[{}] Initialized JobTracker: #nodes = {}, #max_jobs = {}, bundle_size = {}",
            job_type, total_nodes, tracker.max_jobs_total, tracker.bundle_size
        );
        Ok(tracker)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn max_jobs_total(&self) -> usize {
        self.max_jobs_total
    }

    pub fn bundle_size(&self) -> usize {
        self.bundle_size
    }

    pub fn nqueued_sims(&self) -> usize {
        self.queued.len()
    }

    pub fn nrunning_jobs(&self) -> usize {
        self.running.len()
    }

    pub fn nrunning_sims(&self) -> usize {
        self.running.len() * self.bundle_size
    }

    /// Jobs this tracker could start right now given queue and capacity.
    pub fn njobs_to_start(&self) -> usize {
        if self.running.len() >= self.max_jobs_total {
            0
        } else {
            self.queued.len() / self.bundle_size
        }
    }

    /// All simulations currently inside running bundles.
    pub fn running_sims(&self) -> Vec<String> {
        self.running
            .values()
            .flat_map(|job| job.sims.iter().cloned())
            .collect()
    }

    pub fn status(&self) -> TrackerStatus {
        TrackerStatus {
            job_type: self.job_type,
            job_cnt: self.job_cnt,
            nqueued: self.queued.len(),
            nrunning: self.running.len(),
            queued: self.queued.iter().cloned().collect(),
            running: self
                .running
                .iter()
                .map(|(id, job)| (id.to_string(), job.sims.clone()))
                .collect(),
        }
    }

    pub fn state(&self) -> TrackerState {
        TrackerState {
            job_type: self.job_type,
            job_cnt: self.job_cnt,
            queued: self.queued.iter().cloned().collect(),
            running: self
                .running
                .iter()
                .map(|(id, job)| (id.to_string(), job.sims.clone()))
                .collect(),
            ts: None,
        }
    }

    /// Write the tracker state through the checkpoint layer.
    pub fn checkpoint(&self, path: &Path) -> Result<()> {
        let value = serde_yaml::to_value(self.state())?;
        let serde_yaml::Value::Mapping(mapping) = value else {
            bail!("[{}] tracker state did not serialize to a mapping", self.job_type);
        };
        strata_store::save_checkpoint(path, mapping, false)?;
        Ok(())
    }

    /// Workdir of one simulation of this job type.
    pub fn dir_sim(&self, simname: &str) -> Result<PathBuf> {
        self.naming.dir_sim(self.spec.sim_dir_family(), simname)
    }

    /// A simulation is set up when its workdir exists on disk.
    pub fn is_setup(&self, simname: &str) -> bool {
        self.dir_sim(simname).map(|dir| dir.is_dir()).unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Signal flags
    // ------------------------------------------------------------------

    /// Sample the signal flags of each sim once.
    pub fn check_sim_status(&self, sims: &[String]) -> Vec<SimulationStatus> {
        sims.iter()
            .map(|sim| {
                let dir = match self.dir_sim(sim) {
                    Ok(dir) => dir,
                    Err(e) => {
                        error!("[{}] cannot resolve workdir for ({}): {}", self.job_type, sim, e);
                        return SimulationStatus::Unknown;
                    }
                };
                if test_signal(&dir, self.flag_success) {
                    debug!("[{}] found ({})/({})", self.job_type, dir.display(), self.flag_success);
                    SimulationStatus::Success
                } else if test_signal(&dir, self.flag_failure) {
                    debug!("[{}] found ({})/({})", self.job_type, dir.display(), self.flag_failure);
                    SimulationStatus::Failed
                } else {
                    SimulationStatus::Unknown
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    /// Add simulations to the queue, rejecting duplicates and anything
    /// already queued or running. Returns the names actually added.
    pub fn enqueue(&mut self, sim_names: &[String], prepend: bool) -> Result<Vec<String>> {
        self.verify_invariants()?;
        if sim_names.is_empty() {
            return Ok(Vec::new());
        }
        info!("[{}] Adding {} sims: {}", self.job_type, sim_names.len(), self);

        // Collapse duplicates in the input, preserving first occurrence.
        let mut seen = HashSet::new();
        let mut sims: Vec<String> = sim_names
            .iter()
            .filter(|s| seen.insert((*s).clone()))
            .cloned()
            .collect();
        if sims.len() < sim_names.len() {
            warn!("[{}] Found only {} unique sims", self.job_type, sims.len());
        }

        let queued_set: HashSet<&String> = self.queued.iter().collect();
        let (rejected, kept): (Vec<String>, Vec<String>) =
            sims.drain(..).partition(|s| queued_set.contains(s));
        if !rejected.is_empty() {
            warn!(
                "[{}] Rejecting {} already queued sims: {:?}",
                self.job_type,
                rejected.len(),
                rejected
            );
            self.journal.record(
                HistoryEvent::Rejected,
                &rejected,
                self.running.len(),
                self.queued.len(),
                "add_to_queue:already_queued",
            )?;
        }
        let mut sims = kept;

        let running_sims: HashSet<String> = self.running_sims().into_iter().collect();
        let (rejected, kept): (Vec<String>, Vec<String>) =
            sims.drain(..).partition(|s| running_sims.contains(s));
        if !rejected.is_empty() {
            warn!(
                "[{}] Rejecting {} already running sims: {:?}",
                self.job_type,
                rejected.len(),
                rejected
            );
            self.journal.record(
                HistoryEvent::Rejected,
                &rejected,
                self.running.len(),
                self.queued.len(),
                "add_to_queue:already_running",
            )?;
        }
        let sims = kept;

        let event = if prepend {
            for sim in sims.iter().rev() {
                self.queued.push_front(sim.clone());
            }
            HistoryEvent::PrependedToQueue
        } else {
            self.queued.extend(sims.iter().cloned());
            HistoryEvent::AppendedToQueue
        };
        self.journal.record(
            event,
            &sims,
            self.running.len(),
            self.queued.len(),
            "add_to_queue",
        )?;
        debug!("[{}] added {} sims: {}: {:?}", self.job_type, sims.len(), self, sims);
        Ok(sims)
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    /// Start up to `n_jobs` bundles. Returns the number of jobs actually
    /// started and the simulations they carry.
    pub fn start_jobs(&mut self, n_jobs: usize) -> Result<(usize, Vec<String>)> {
        self.verify_invariants()?;
        if n_jobs == 0 {
            return Ok((0, Vec::new()));
        }
        info!("{self}");

        // Bounded by caller request, remaining capacity, and whole bundles
        // available in the queue.
        let capacity = self.max_jobs_total - self.running.len();
        let actual = n_jobs
            .min(capacity)
            .min(self.queued.len() / self.bundle_size);
        if actual == 0 {
            debug!(
                "[{}] Nothing to do (requested = {}, capacity = {}, whole bundles = {})",
                self.job_type,
                n_jobs,
                capacity,
                self.queued.len() / self.bundle_size
            );
            return Ok((0, Vec::new()));
        }

        // Sort only the selected prefix so equal queues bundle identically.
        let n_sims = actual * self.bundle_size;
        let mut sims_started: Vec<String> = self.queued.iter().take(n_sims).cloned().collect();
        sims_started.sort();
        let bundles: Vec<Vec<String>> = sims_started
            .chunks(self.bundle_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        debug!("[{}] sims_to_start = {:?}", self.job_type, sims_started);

        if !self.do_scheduling {
            info!("[{}] Scheduling disabled", self.job_type);
            self.queued.drain(..n_sims);
            for bundle in bundles {
                let id = JobId::new(Uuid::new_v4().simple().to_string());
                self.running.insert(id.clone(), Job::new(self.job_type, id, bundle));
                self.job_cnt += 1;
            }
            self.verify_invariants()?;
            return Ok((actual, sims_started));
        }

        // Render before draining so a template failure leaves the queue
        // untouched.
        info!(
            "[{}] START_JOB -- pooled script generation for {} bundles",
            self.job_type,
            bundles.len()
        );
        let rendered = self.render_scripts(&bundles)?;
        info!("[{}] START_JOB -- finished script generation", self.job_type);
        self.queued.drain(..n_sims);

        // Submissions stay serialized to the adapter.
        let mut started_sims = Vec::with_capacity(n_sims);
        let mut started_jobs = 0;
        let mut failed_bundles: Vec<Vec<String>> = Vec::new();
        let mut submit_errors: Vec<String> = Vec::new();
        for (bundle, step, script) in rendered {
            debug!("[{}] submitting script {}", self.job_type, script.display());
            match self.adapter.submit(&step, &script, &self.workspace) {
                Ok(job_id) => {
                    debug!("[{}] Started job {} for {:?}", self.job_type, job_id, bundle);
                    started_sims.extend(bundle.iter().cloned());
                    started_jobs += 1;
                    self.running
                        .insert(job_id.clone(), Job::new(self.job_type, job_id, bundle));
                }
                Err(e) => {
                    error!(
                        "[{}] Failed to submit a job for {:?}: {:#}",
                        self.job_type, bundle, e
                    );
                    submit_errors.push(format!("{bundle:?}: {e:#}"));
                    failed_bundles.push(bundle);
                }
            }
        }

        self.journal.record(
            HistoryEvent::Started,
            &started_sims,
            self.running.len(),
            self.queued.len(),
            "start_jobs",
        )?;
        info!("[{}] Started {} jobs: {}", self.job_type, started_jobs, self);

        if !failed_bundles.is_empty() {
            // Unsubmitted work returns to the queue head; the failure still
            // surfaces to the caller.
            let requeued: Vec<String> = failed_bundles.iter().flatten().cloned().collect();
            for sim in requeued.iter().rev() {
                self.queued.push_front(sim.clone());
            }
            self.journal.record(
                HistoryEvent::PrependedToQueue,
                &requeued,
                self.running.len(),
                self.queued.len(),
                "start_jobs:submit_failed",
            )?;
            self.verify_invariants()?;
            bail!(
                "[{}] failed to submit {} of {} bundles: {}",
                self.job_type,
                failed_bundles.len(),
                actual,
                submit_errors.join("; ")
            );
        }

        self.verify_invariants()?;
        Ok((started_jobs, started_sims))
    }

    /// Render every bundle's launch script on a bounded worker pool.
    fn render_scripts(&self, bundles: &[Vec<String>]) -> Result<Vec<(Vec<String>, LaunchStep, PathBuf)>> {
        let nworkers = RENDER_POOL_SIZE.min(bundles.len()).max(1);

        let mut collected: Vec<(usize, Result<(LaunchStep, PathBuf)>)> =
            std::thread::scope(|scope| {
                let (tx, rx) = mpsc::channel();
                for worker in 0..nworkers {
                    let tx = tx.clone();
                    scope.spawn(move || {
                        mask_termination_signals();
                        for (index, bundle) in
                            bundles.iter().enumerate().skip(worker).step_by(nworkers)
                        {
                            let rendered = self.render_one(bundle);
                            if tx.send((index, rendered)).is_err() {
                                break;
                            }
                        }
                    });
                }
                drop(tx);
                rx.into_iter().collect()
            });
        collected.sort_by_key(|(index, _)| *index);

        let mut out = Vec::with_capacity(bundles.len());
        for (index, rendered) in collected {
            let (step, script) = rendered.with_context(|| {
                format!(
                    "[{}] failed to render launch script for bundle {:?}",
                    self.job_type, bundles[index]
                )
            })?;
            out.push((bundles[index].clone(), step, script));
        }
        Ok(out)
    }

    fn render_one(&self, bundle: &[String]) -> Result<(LaunchStep, PathBuf)> {
        let step = self.create_step(bundle)?;
        debug!("[{}] step created: {}", self.job_type, step.name);
        let script = self.adapter.write_script(&self.workspace, &step)?;
        Ok((step, script))
    }

    /// Build the launch description of one bundle.
    pub fn create_step(&self, bundle: &[String]) -> Result<LaunchStep> {
        ensure!(
            bundle.len() == self.bundle_size,
            "[{}] bundle of {} sims does not match bundle_size = {}",
            self.job_type,
            bundle.len(),
            self.bundle_size
        );

        let cname = ScriptRenderer::bundle_name(bundle);
        let command = self.command(bundle)?;
        let rc = &self.spec.config;
        Ok(LaunchStep {
            name: format!("{}-{}", self.spec.jobname, cname),
            description: self.spec.jobdesc.replacen("{}", &cname, 1),
            command,
            nodes: rc.nnodes,
            procs: rc.nprocs,
            cores_per_task: rc.cores_per_task,
            gpus: rc.ngpus,
            walltime: rc.walltime.clone(),
            use_broker: rc.use_broker,
            broker_options: rc.broker_options.clone(),
            wrapper: rc.wrapper.clone(),
        })
    }

    /// Render the shell script for one bundle.
    pub fn command(&self, bundle: &[String]) -> Result<String> {
        ensure!(
            bundle.len() == self.bundle_size,
            "[{}] bundle of {} sims does not match bundle_size = {}",
            self.job_type,
            bundle.len(),
            self.bundle_size
        );
        ScriptRenderer::new(&self.spec)?.render(bundle)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Reconcile every running job against scheduler truth and signal
    /// flags, sampled once each. Returns `(successes, failures)`.
    pub fn update(&mut self) -> Result<(Vec<String>, Vec<String>)> {
        self.verify_invariants()?;
        if self.running.is_empty() {
            debug!("[{}] no running jobs: {}", self.job_type, self);
            return Ok((Vec::new(), Vec::new()));
        }
        info!("{self}");

        let ids: Vec<JobId> = self.running.keys().cloned().collect();
        debug!("[{}] Fetching status for {} jobs", self.job_type, ids.len());
        let statuses = match self.job_statuses(&ids)? {
            Some(statuses) => statuses,
            // Scheduler uncertainty: never reclaim on a bad answer.
            None => return Ok((Vec::new(), Vec::new())),
        };

        let mut sims_success = Vec::new();
        let mut sims_failed = Vec::new();
        let mut sims_continue = Vec::new();
        let mut jobs_to_reclaim = Vec::new();
        let mut jobs_to_cancel = Vec::new();

        for id in &ids {
            let job = &self.running[id];
            let (alive, timed_out) = statuses[id];

            // A timed-out job failed regardless of what its sims published.
            let sim_status = if !alive && timed_out {
                vec![SimulationStatus::Failed; job.len()]
            } else {
                self.check_sim_status(&job.sims)
            };

            let any_unknown = sim_status.iter().any(|s| !s.is_terminal());
            let any_failed = sim_status.iter().any(|s| *s == SimulationStatus::Failed);
            if alive && any_unknown {
                continue;
            }

            jobs_to_reclaim.push(id.clone());
            if alive && any_failed {
                jobs_to_cancel.push(id.clone());
            }

            debug!(
                "[{}] job {}: status = {:?}, alive = {}, timed_out = {}",
                self.job_type, id, sim_status, alive, timed_out
            );
            let (ok, bad, rest) = split_by_status(&job.sims, &sim_status);
            sims_success.extend(ok);
            sims_failed.extend(bad);
            sims_continue.extend(rest);
        }

        info!(
            "[{}] processed all jobs: (#jobs: continue = {}, reclaim = {}, cancel = {}), \
             (#sims: success = {}, failed = {}, continue = {})",
            self.job_type,
            ids.len() - jobs_to_reclaim.len(),
            jobs_to_reclaim.len(),
            jobs_to_cancel.len(),
            sims_success.len(),
            sims_failed.len(),
            sims_continue.len()
        );

        self.journal.record(
            HistoryEvent::FoundSuccess,
            &sims_success,
            self.running.len(),
            self.queued.len(),
            "update",
        )?;
        self.journal.record(
            HistoryEvent::FoundFailed,
            &sims_failed,
            self.running.len(),
            self.queued.len(),
            "update",
        )?;

        // A bundle of one ending with no flag means the sim died silently.
        if self.bundle_size == 1 && !sims_continue.is_empty() {
            error!(
                "[{}] {} sims ended without publishing a flag: {:?}",
                self.job_type,
                sims_continue.len(),
                sims_continue
            );
        }

        if !jobs_to_cancel.is_empty() {
            debug!("[{}] Cancelling {} jobs", self.job_type, jobs_to_cancel.len());
            self.cancel_jobs(&jobs_to_cancel);
        }
        for id in &jobs_to_reclaim {
            self.running.remove(id);
        }
        if !sims_continue.is_empty() {
            self.enqueue(&sims_continue, true)?;
        }

        info!("{self}");
        self.verify_invariants()?;
        Ok((sims_success, sims_failed))
    }

    /// Batched `(alive, timed_out)` per job; `None` when the scheduler's
    /// answer is unusable this tick.
    fn job_statuses(&self, ids: &[JobId]) -> Result<Option<HashMap<JobId, (bool, bool)>>> {
        if !self.do_scheduling {
            // No scheduler, no liveness: classification runs on flags alone.
            return Ok(Some(
                ids.iter().map(|id| (id.clone(), (false, false))).collect(),
            ));
        }

        let (code, states) = self.adapter.check_jobs(ids)?;
        if matches!(code, StatusCode::NoJobs | StatusCode::Error) {
            debug!(
                "[{}] Cannot classify jobs this tick (code = {:?}, jobs = {:?})",
                self.job_type, code, ids
            );
            return Ok(None);
        }

        Ok(Some(
            ids.iter()
                .map(|id| {
                    let state = states.get(id).copied().unwrap_or(JobState::NotFound);
                    (id.clone(), (state.is_active(), state.is_timed_out()))
                })
                .collect(),
        ))
    }

    /// Single-job liveness probe used by restore.
    fn is_job_alive(&self, id: &JobId) -> Result<bool> {
        if !self.do_scheduling {
            debug!("[{}] Scheduling disabled; treating {} as dead", self.job_type, id);
            return Ok(false);
        }
        let (code, states) = self.adapter.check_jobs(std::slice::from_ref(id))?;
        if matches!(code, StatusCode::NoJobs | StatusCode::Error) {
            debug!("[{}] Unusable answer for job {} (code = {:?})", self.job_type, id, code);
            return Ok(false);
        }
        Ok(states.get(id).map(JobState::is_active).unwrap_or(false))
    }

    /// Cancel jobs; idempotent, tolerates already-dead jobs, never raises.
    pub fn cancel_jobs(&self, ids: &[JobId]) -> bool {
        if !self.do_scheduling {
            return true;
        }
        match self.adapter.cancel_jobs(ids) {
            CancelCode::Ok => {
                info!("[{}] Successfully canceled {} jobs", self.job_type, ids.len());
                true
            }
            CancelCode::Error => {
                error!("[{}] Failed to cancel jobs", self.job_type);
                false
            }
            CancelCode::Unknown => {
                error!("[{}] Unknown error cancelling jobs", self.job_type);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    /// Hydrate queue and running set from a prior checkpoint, reconciling
    /// against current scheduler truth. Returns terminal sims found along
    /// the way as `(successes, failures)`.
    pub fn restore(
        &mut self,
        state: TrackerState,
        check_running_jobs: bool,
    ) -> Result<(Vec<String>, Vec<String>)> {
        self.verify_invariants()?;
        ensure!(
            state.job_type == self.job_type,
            "[{}] checkpoint is for job type {}",
            self.job_type,
            state.job_type
        );
        self.job_cnt = state.job_cnt;

        let mut jobs_running: Vec<(JobId, Vec<String>)> = state
            .running
            .into_iter()
            .map(|(id, sims)| (JobId::new(id), sims))
            .collect();
        let sims_queued = state.queued;

        info!(
            "[{}] Restoring JobTracker: running = {} jobs, queued = {} sims",
            self.job_type,
            jobs_running.len(),
            sims_queued.len()
        );
        if jobs_running.is_empty() && sims_queued.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        self.journal.record(
            HistoryEvent::Restore,
            &[
                format!("running={}", jobs_running.len()),
                format!("queued={}", sims_queued.len()),
            ],
            self.running.len(),
            self.queued.len(),
            "restore",
        )?;

        if check_running_jobs {
            let mut restored_ids = HashSet::new();
            let mut sims_restored = Vec::new();
            for (id, sims) in &jobs_running {
                if self.running.len() >= self.max_jobs_total {
                    break;
                }
                debug!("[{}] is job {} running? {:?}", self.job_type, id, sims);
                if self.is_job_alive(id)? {
                    debug!("[{}] Restoring job {}: sims = {:?}", self.job_type, id, sims);
                    self.running
                        .insert(id.clone(), Job::new(self.job_type, id.clone(), sims.clone()));
                    restored_ids.insert(id.clone());
                    sims_restored.extend(sims.iter().cloned());
                }
            }
            info!("[{}] Restored {} jobs", self.job_type, self.running.len());
            self.journal.record(
                HistoryEvent::Restored,
                &sims_restored,
                self.running.len(),
                self.queued.len(),
                "restore",
            )?;
            jobs_running.retain(|(id, _)| !restored_ids.contains(id));
        }

        let sims_not_restored: Vec<String> = jobs_running
            .into_iter()
            .flat_map(|(_, sims)| sims)
            .collect();

        // Strict coherence: a sim without its on-disk setup poisons the
        // whole restore.
        let sims_not_restored =
            self.reject_unprepared(sims_not_restored, "restore:incorrect_setup/running")?;
        let sims_queued = self.reject_unprepared(sims_queued, "restore:incorrect_setup/queued")?;

        let statuses = self.check_sim_status(&sims_not_restored);
        let (sims_success, sims_failed, sims_continue) =
            split_by_status(&sims_not_restored, &statuses);

        self.journal.record(
            HistoryEvent::FoundSuccess,
            &sims_success,
            self.running.len(),
            self.queued.len(),
            "restore",
        )?;
        self.journal.record(
            HistoryEvent::FoundFailed,
            &sims_failed,
            self.running.len(),
            self.queued.len(),
            "restore",
        )?;

        info!(
            "[{}] Queuing {} previously-running sims",
            self.job_type,
            sims_continue.len()
        );
        self.enqueue(&sims_continue, true)?;
        self.enqueue(&sims_queued, false)?;

        info!("{self}");
        self.verify_invariants()?;
        Ok((sims_success, sims_failed))
    }

    /// Drop sims whose workdir is missing; any offender fails the restore
    /// after being journaled.
    fn reject_unprepared(&self, sims: Vec<String>, comment: &str) -> Result<Vec<String>> {
        let (kept, rejected): (Vec<String>, Vec<String>) =
            sims.into_iter().partition(|s| self.is_setup(s));
        if !rejected.is_empty() {
            error!(
                "[{}] Found sims that were not set up correctly: {:?}",
                self.job_type, rejected
            );
            self.journal.record(
                HistoryEvent::Rejected,
                &rejected,
                self.running.len(),
                self.queued.len(),
                comment,
            )?;
            bail!(
                "[{}] {} sims are missing their on-disk setup: {:?}",
                self.job_type,
                rejected.len(),
                rejected
            );
        }
        Ok(kept)
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    /// Structural invariants checked at every public entry point.
    fn verify_invariants(&self) -> Result<()> {
        ensure!(
            self.running.len() <= self.max_jobs_total,
            "[{}] {} running jobs exceed max_jobs_total = {}",
            self.job_type,
            self.running.len(),
            self.max_jobs_total
        );

        let mut seen: HashSet<&String> = HashSet::new();
        for sim in &self.queued {
            ensure!(seen.insert(sim), "[{}] duplicate queued sim ({})", self.job_type, sim);
        }
        for job in self.running.values() {
            ensure!(
                job.len() == self.bundle_size,
                "[{}] job {} carries {} sims instead of {}",
                self.job_type,
                job.id,
                job.len(),
                self.bundle_size
            );
            for sim in &job.sims {
                ensure!(
                    seen.insert(sim),
                    "[{}] sim ({}) appears in more than one place",
                    self.job_type,
                    sim
                );
            }
        }
        Ok(())
    }
}

impl fmt::Display for JobTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JobTracker[{}]: #max_jobs = {}, #running = {}, #queued = {}",
            self.job_type,
            self.max_jobs_total,
            self.running.len(),
            self.queued.len()
        )
    }
}
