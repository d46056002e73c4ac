// src/engine/batch.rs
//
// Batch Manager: an ordered list of jobs run one at a time on a single
// Pool Controller.
//
// A driver thread activates the first Queued job, feeds its discovery stream
// to the controller, waits for the run to settle and advances:
//   run Idle    -> job Completed
//   run Stopped -> job Cancelled (then Continue or Halt per AdvancePolicy)
//   discovery error on the root -> job Failed
//
// Lock order: board -> controller. Control calls that touch the controller
// hold the board lock so they cannot race the driver starting the next job.

use crate::config::{AdvancePolicy, BatchConfig};
use crate::engine::common::run_with_panic_policy;
use crate::engine::controller::{PoolController, PoolState, StopReport};
use crate::engine::converter::Converter;
use crate::engine::discovery::{Discovery, ExtensionScanner};
use crate::engine::events::EventSink;
use crate::engine::job::{DestinationPlanner, Job, JobId, JobSpec, JobStatus, ScanSummary};
use crate::engine::retire::TrashDir;
use crate::engine::stats::StatsSnapshot;
use crate::error::BatchError;
use crate::task::Task;
use chrono::Utc;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const DRIVER_THREAD_NAME: &str = "lazy-batch-driver";

/// Job counts by status plus summed counters across every job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BatchTotals {
    pub jobs: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub stats: StatsSnapshot,
}

impl BatchTotals {
    pub fn success_rate(&self) -> f64 {
        self.stats.success_rate()
    }

    /// Any failed task or failed job
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.stats.failed > self.stats.cancelled
    }
}

#[derive(Debug, Default)]
struct Board {
    jobs: Vec<Job>,
    current: Option<JobId>,
    policy: AdvancePolicy,
    /// The current job's run has been handed to the controller
    run_started: bool,
    /// Discovery totals of the current job, filled by the producer thread
    scan: Option<Arc<Mutex<ScanSummary>>>,
    stop_requested: bool,
    pause_requested: bool,
    driving: bool,
    halted: bool,
}

impl Board {
    fn index_of(&self, id: JobId) -> Option<usize> {
        self.jobs.iter().position(|job| job.id == id)
    }

    fn active_index(&self, operation: &'static str) -> Result<usize, BatchError> {
        self.current
            .and_then(|id| self.index_of(id))
            .filter(|&i| self.jobs[i].status.is_active())
            .ok_or_else(|| BatchError::invalid_state(operation, "no active job"))
    }
}

struct Shared {
    controller: PoolController,
    discovery: Arc<dyn Discovery>,
    // shared by every job so flattened outputs never collide across roots
    planner: Arc<Mutex<DestinationPlanner>>,
    board: Mutex<Board>,
    changed: Condvar,
}

pub struct BatchManager {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl BatchManager {
    pub fn new(controller: PoolController, discovery: Arc<dyn Discovery>) -> Self {
        Self {
            shared: Arc::new(Shared {
                controller,
                discovery,
                planner: Arc::new(Mutex::new(DestinationPlanner::new())),
                board: Mutex::new(Board::default()),
                changed: Condvar::new(),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Manager wired with the default collaborators described by `config`.
    pub fn from_config(
        config: &BatchConfig,
        converter: Arc<dyn Converter>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, BatchError> {
        config.validate()?;
        let mut controller =
            PoolController::new(config.pool.clone(), converter)?.with_event_sink(sink);
        if let Some(trash) = &config.trash_dir {
            controller = controller.with_retirer(Arc::new(TrashDir::new(trash)));
        }
        let discovery = ExtensionScanner::new(&config.extensions);
        let manager = Self::new(controller, Arc::new(discovery)).with_policy(config.on_cancel);
        *manager.shared.planner.lock() = DestinationPlanner::new().protecting(&config.extensions);
        Ok(manager)
    }

    pub fn with_policy(self, policy: AdvancePolicy) -> Self {
        self.shared.board.lock().policy = policy;
        self
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        self.shared.board.lock()
    }

    /// Append a job with status Queued.
    pub fn add_job(&self, spec: JobSpec) -> Result<JobId, BatchError> {
        spec.options.validate()?;
        let job = Job::new(spec);
        let id = job.id;
        info!(job = %id, root = %job.spec.root.display(), "job queued");
        self.board().jobs.push(job);
        Ok(id)
    }

    /// Remove a job that has not started yet.
    pub fn remove_job(&self, id: JobId) -> Result<Job, BatchError> {
        let mut board = self.board();
        let index = board
            .index_of(id)
            .ok_or_else(|| BatchError::job_not_found(id.to_string()))?;
        let status = board.jobs[index].status;
        if status != JobStatus::Queued {
            return Err(BatchError::invalid_operation(format!(
                "job {id} is {status}; only queued jobs can be removed"
            )));
        }
        debug!(job = %id, "job removed");
        Ok(board.jobs.remove(index))
    }

    /// Start driving queued jobs. No-op when already driving or nothing is queued.
    pub fn start(&self) -> Result<(), BatchError> {
        {
            let mut board = self.board();
            if board.driving {
                return Ok(());
            }
            if !board.jobs.iter().any(|job| job.status == JobStatus::Queued) {
                debug!("no queued jobs to start");
                return Ok(());
            }
            board.driving = true;
            board.halted = false;
        }

        let mut driver = self.driver.lock();
        // a previous driver has already cleared `driving` and is exiting
        if let Some(previous) = driver.take() {
            if previous.join().is_err() {
                error!("batch driver panicked");
            }
        }
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(DRIVER_THREAD_NAME.to_string())
            .spawn(move || shared.drive());
        match spawned {
            Ok(handle) => {
                *driver = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.board().driving = false;
                self.shared.changed.notify_all();
                Err(BatchError::internal_fault(format!(
                    "failed to spawn batch driver: {e}"
                )))
            }
        }
    }

    pub fn pause_current(&self) -> Result<(), BatchError> {
        let mut board = self.board();
        let index = board.active_index("pause")?;
        if board.jobs[index].status == JobStatus::Paused {
            return Ok(());
        }
        if board.run_started {
            self.ignore_if_settled(self.shared.controller.pause())?;
        }
        board.pause_requested = true;
        board.jobs[index].status = JobStatus::Paused;
        info!(job = %board.jobs[index].id, "job paused");
        Ok(())
    }

    pub fn resume_current(&self) -> Result<(), BatchError> {
        let mut board = self.board();
        let index = board.active_index("resume")?;
        if board.jobs[index].status == JobStatus::Running {
            return Ok(());
        }
        if board.run_started {
            self.ignore_if_settled(self.shared.controller.resume())?;
        }
        board.pause_requested = false;
        board.jobs[index].status = JobStatus::Running;
        info!(job = %board.jobs[index].id, "job resumed");
        Ok(())
    }

    // A run that settled on its own is about to be finalized by the driver
    fn ignore_if_settled(&self, result: Result<(), BatchError>) -> Result<(), BatchError> {
        match result {
            Err(_) if self.shared.controller.state().is_settled() => Ok(()),
            other => other,
        }
    }

    /// Stop the current job. It ends Cancelled and the manager advances
    /// according to its AdvancePolicy.
    pub fn stop_current(&self) -> Result<StopReport, BatchError> {
        let pending = {
            let mut board = self.board();
            let index = board.active_index("stop")?;
            board.stop_requested = true;
            info!(job = %board.jobs[index].id, "stopping job");
            if board.run_started {
                self.shared.controller.begin_stop()
            } else {
                None
            }
        };
        let grace = self.shared.controller.config().stop_grace;
        Ok(pending
            .map(|pending| pending.finish(grace))
            .unwrap_or_default())
    }

    /// Stop the current job (if any) and leave the remaining jobs Queued.
    pub fn stop_batch(&self) -> StopReport {
        let pending = {
            let mut board = self.board();
            board.halted = true;
            if board.active_index("stop").is_err() {
                return StopReport::default();
            }
            board.stop_requested = true;
            info!("stopping batch");
            if board.run_started {
                self.shared.controller.begin_stop()
            } else {
                None
            }
        };
        let grace = self.shared.controller.config().stop_grace;
        pending
            .map(|pending| pending.finish(grace))
            .unwrap_or_default()
    }

    /// Add tasks to the current job's run.
    pub fn enqueue<I>(&self, tasks: I) -> Result<usize, BatchError>
    where
        I: IntoIterator<Item = Task>,
    {
        self.shared.controller.enqueue(tasks)
    }

    /// Counters of the current (or most recent) run.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.shared.controller.snapshot()
    }

    pub fn pool_state(&self) -> PoolState {
        self.shared.controller.state()
    }

    pub fn job_status(&self, id: JobId) -> Option<JobStatus> {
        let board = self.board();
        board.index_of(id).map(|i| board.jobs[i].status)
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        let board = self.board();
        let index = board.index_of(id)?;
        Some(self.live_view(&board, &board.jobs[index]))
    }

    /// All jobs in insertion order.
    pub fn jobs(&self) -> Vec<Job> {
        let board = self.board();
        board
            .jobs
            .iter()
            .map(|job| self.live_view(&board, job))
            .collect()
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.board().current
    }

    fn live_view(&self, board: &Board, job: &Job) -> Job {
        let mut view = job.clone();
        if board.current == Some(job.id) && board.run_started {
            view.stats = self.shared.controller.snapshot();
            if let Some(scan) = &board.scan {
                view.scan = scan.lock().clone();
            }
        }
        view
    }

    pub fn totals(&self) -> BatchTotals {
        let board = self.board();
        let mut totals = BatchTotals {
            jobs: board.jobs.len(),
            ..BatchTotals::default()
        };
        for job in &board.jobs {
            match job.status {
                JobStatus::Queued => totals.queued += 1,
                JobStatus::Running | JobStatus::Paused => totals.active += 1,
                JobStatus::Completed => totals.completed += 1,
                JobStatus::Failed => totals.failed += 1,
                JobStatus::Cancelled => totals.cancelled += 1,
            }
            totals.stats.accumulate(&self.live_view(&board, job).stats);
        }
        totals
    }

    /// Drop every terminal job. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut board = self.board();
        let before = board.jobs.len();
        board.jobs.retain(|job| !job.status.is_terminal());
        before - board.jobs.len()
    }

    /// True while the driver is working through queued jobs
    pub fn is_running(&self) -> bool {
        self.board().driving
    }

    /// Block until the driver has run out of queued jobs or halted.
    pub fn wait(&self) {
        if let Some(handle) = self.driver.lock().take() {
            if handle.join().is_err() {
                error!("batch driver panicked");
            }
        }
    }

    /// Like wait(), giving up after `timeout`. True if the driver finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut board = self.board();
        while board.driving {
            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut board, deadline).timed_out() {
                        return !board.driving;
                    }
                }
                None => self.shared.changed.wait(&mut board),
            }
        }
        true
    }
}

impl Drop for BatchManager {
    fn drop(&mut self) {
        let pending = {
            let mut board = self.shared.board.lock();
            board.halted = true;
            board.stop_requested = true;
            if board.run_started {
                self.shared.controller.begin_stop()
            } else {
                None
            }
        };
        if let Some(pending) = pending {
            pending.finish(Duration::ZERO);
        }
        if let Some(handle) = self.driver.get_mut().take() {
            if handle.join().is_err() {
                error!("batch driver panicked");
            }
        }
    }
}

impl Shared {
    fn drive(&self) {
        while let Some((id, spec)) = self.activate_next() {
            self.run_job(id, &spec);
        }
    }

    fn activate_next(&self) -> Option<(JobId, JobSpec)> {
        let mut board = self.board.lock();
        let next = if board.halted {
            None
        } else {
            board
                .jobs
                .iter()
                .position(|job| job.status == JobStatus::Queued)
        };
        let Some(index) = next else {
            board.driving = false;
            board.current = None;
            self.changed.notify_all();
            info!(halted = board.halted, "batch finished");
            return None;
        };

        let job = &mut board.jobs[index];
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        let activated = (job.id, job.spec.clone());
        board.current = Some(activated.0);
        board.run_started = false;
        board.stop_requested = false;
        board.pause_requested = false;
        self.changed.notify_all();
        Some(activated)
    }

    fn run_job(&self, id: JobId, spec: &JobSpec) {
        info!(job = %id, root = %spec.root.display(), "job started");
        // a panicking discovery fails its job instead of taking the driver down
        let paths = match run_with_panic_policy("discover", || {
            self.discovery.discover(&spec.root)
        }) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(job = %id, error = %err, "discovery failed");
                self.settle(id, JobStatus::Failed, StatsSnapshot::default(), Some(err.to_string()));
                return;
            }
        };
        let scan = Arc::new(Mutex::new(ScanSummary::default()));
        let feed = {
            let scan = Arc::clone(&scan);
            let planner = Arc::clone(&self.planner);
            let spec = spec.clone();
            paths.map(move |entry| match entry {
                Ok(source) => {
                    scan.lock().record_file(&source);
                    Ok(planner.lock().plan(&spec, &source))
                }
                Err(err) => {
                    scan.lock().record_error(&err);
                    Err(err)
                }
            })
        };

        {
            let mut board = self.board.lock();
            if board.stop_requested {
                drop(board);
                self.settle(id, JobStatus::Cancelled, StatsSnapshot::default(), None);
                return;
            }
            if let Err(err) = self.controller.start(feed) {
                drop(board);
                error!(job = %id, error = %err, "failed to start run");
                self.settle(id, JobStatus::Failed, StatsSnapshot::default(), Some(err.to_string()));
                return;
            }
            board.run_started = true;
            board.scan = Some(Arc::clone(&scan));
            if board.pause_requested {
                if let Err(err) = self.controller.pause() {
                    debug!(job = %id, error = %err, "deferred pause not applied");
                }
            }
        }

        let state = self.controller.wait();
        let stats = self.controller.snapshot();
        let status = match state {
            PoolState::Stopped => JobStatus::Cancelled,
            _ => JobStatus::Completed,
        };
        let scan = scan.lock().clone();
        self.settle_with_scan(id, status, stats, scan, None);
    }

    fn settle(&self, id: JobId, status: JobStatus, stats: StatsSnapshot, error: Option<String>) {
        self.settle_with_scan(id, status, stats, ScanSummary::default(), error);
    }

    fn settle_with_scan(
        &self,
        id: JobId,
        status: JobStatus,
        stats: StatsSnapshot,
        scan: ScanSummary,
        error: Option<String>,
    ) {
        let mut board = self.board.lock();
        if let Some(index) = board.index_of(id) {
            let job = &mut board.jobs[index];
            job.status = status;
            job.stats = stats;
            job.scan = scan;
            job.finished_at = Some(Utc::now());
            job.error = error;
        }
        board.current = None;
        board.run_started = false;
        board.scan = None;
        if status == JobStatus::Cancelled && board.policy == AdvancePolicy::Halt {
            board.halted = true;
        }
        self.changed.notify_all();
        info!(
            job = %id,
            %status,
            succeeded = stats.succeeded,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "job finished"
        );
    }
}
