// src/engine/controller.rs
//
// Pool Controller: the lifecycle of a run and the external control surface.
//
// State machine:
//   Idle|Stopped -> Running       start()
//   Running <-> Paused            pause() / resume()
//   Running|Paused -> Draining    stop(): queue closed, unclaimed tasks Cancelled
//   Draining -> Stopped           every submitted task has a result, or grace expired
//   Running|Paused -> Idle        feed exhausted and every submitted task has a result
//
// Lock order: controller.current -> Run.core -> queue / statistics.
// Nothing takes Run.core while holding the queue or statistics locks.

use crate::config::PoolConfig;
use crate::engine::common::run_with_panic_policy;
use crate::engine::converter::Converter;
use crate::engine::events::{EventSink, NullSink};
use crate::engine::pool::{build_thread_pool, run_producer, run_worker, PRODUCER_THREAD_NAME};
use crate::engine::queue::TaskQueue;
use crate::engine::retire::SourceRetirer;
use crate::engine::stats::{Statistics, StatsSnapshot};
use crate::error::BatchError;
use crate::task::{FailureKind, Task, TaskResult};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rayon::ThreadPool;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PoolState {
    Idle,
    Running,
    Paused,
    Draining,
    Stopped,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Idle => "Idle",
            PoolState::Running => "Running",
            PoolState::Paused => "Paused",
            PoolState::Draining => "Draining",
            PoolState::Stopped => "Stopped",
        }
    }

    /// Idle or Stopped: no run is making progress
    pub fn is_settled(&self) -> bool {
        matches!(self, PoolState::Idle | PoolState::Stopped)
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stop() call did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Tasks this stop recorded as Cancelled: the queued ones plus any a
    /// worker had claimed but not yet started
    pub discarded: usize,
    /// Tasks executing when the stop began
    pub in_flight: u64,
    /// Tasks still executing when the grace period ran out
    pub still_running: u64,
    pub timed_out: bool,
}

#[derive(Debug)]
struct RunCore {
    state: PoolState,
    producer_done: bool,
    /// Admitted tasks whose result is not yet fully published
    active: u64,
    live_workers: usize,
}

/// One start()..Idle/Stopped cycle. Shared by the workers, the producer and
/// the controller.
pub(crate) struct Run {
    id: u64,
    core: Mutex<RunCore>,
    changed: Condvar,
    queue: TaskQueue,
    stats: Statistics,
    converter: Arc<dyn Converter>,
    retirer: Option<Arc<dyn SourceRetirer>>,
    sink: Arc<dyn EventSink>,
}

impl Run {
    fn new(id: u64, config: &PoolConfig, services: &PoolController) -> Self {
        Self {
            id,
            core: Mutex::new(RunCore {
                state: PoolState::Running,
                producer_done: false,
                active: 0,
                live_workers: config.workers,
            }),
            changed: Condvar::new(),
            queue: TaskQueue::new(config.queue_capacity),
            stats: Statistics::new(),
            converter: Arc::clone(&services.converter),
            retirer: services.retirer.clone(),
            sink: Arc::clone(&services.sink),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub(crate) fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub(crate) fn converter(&self) -> &dyn Converter {
        self.converter.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, RunCore> {
        self.core.lock()
    }

    pub(crate) fn state(&self) -> PoolState {
        self.lock().state
    }

    pub(crate) fn accepts_work(&self) -> bool {
        matches!(self.state(), PoolState::Running | PoolState::Paused)
    }

    /// Block while paused. False once the run no longer hands out work.
    pub(crate) fn wait_runnable(&self) -> bool {
        let mut core = self.lock();
        while core.state == PoolState::Paused {
            self.changed.wait(&mut core);
        }
        core.state == PoolState::Running
    }

    /// Admit a claimed task. Re-checks pause and stop, since either may have
    /// happened while the worker waited on the queue.
    pub(crate) fn admit(&self) -> bool {
        let mut core = self.lock();
        while core.state == PoolState::Paused {
            self.changed.wait(&mut core);
        }
        if core.state != PoolState::Running {
            return false;
        }
        core.active += 1;
        self.stats.task_started();
        true
    }

    pub(crate) fn submit(&self, task: Task) -> Result<(), BatchError> {
        {
            let core = self.lock();
            if !matches!(core.state, PoolState::Running | PoolState::Paused) {
                return Err(BatchError::invalid_state("enqueue", core.state.as_str()));
            }
            // counted before the push so a fast worker can never record a
            // result for a task that is not yet submitted
            self.stats.task_submitted();
        }
        match self.queue.push(task) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                self.record_unstarted(&rejected.into_task());
                Err(BatchError::queue_closed())
            }
        }
    }

    pub(crate) fn try_submit(&self, task: Task) -> Result<(), BatchError> {
        let core = self.lock();
        if !matches!(core.state, PoolState::Running | PoolState::Paused) {
            return Err(BatchError::invalid_state("enqueue", core.state.as_str()));
        }
        // Holding core keeps workers from admitting (and recording) this task
        // until it is counted
        match self.queue.try_push(task) {
            Ok(()) => {
                self.stats.task_submitted();
                Ok(())
            }
            Err(rejected) => Err(rejected.into_error(self.queue.capacity())),
        }
    }

    /// Record the result of an admitted task, then retire and publish.
    pub(crate) fn finish(&self, task: &Task, result: TaskResult) {
        self.stats.record(&result);
        log_result(self.id, &result);
        if result.is_success() && task.options().retire_source {
            self.retire_source(task);
        }
        self.publish(&result);

        let mut core = self.lock();
        core.active = core.active.saturating_sub(1);
        self.check_drained(&mut core);
        self.changed.notify_all();
    }

    /// Record a task that never started.
    pub(crate) fn record_unstarted(&self, task: &Task) {
        let result = TaskResult::cancelled(task);
        self.stats.record(&result);
        log_result(self.id, &result);
        self.publish(&result);

        let mut core = self.lock();
        self.check_drained(&mut core);
        self.changed.notify_all();
    }

    fn retire_source(&self, task: &Task) {
        let Some(retirer) = &self.retirer else {
            warn!(
                source = %task.source().display(),
                "source retirement requested but no trash directory is configured"
            );
            return;
        };
        match run_with_panic_policy("retire", || retirer.retire(task.source())) {
            Ok(target) => debug!(
                task = task.id(),
                source = %task.source().display(),
                target = %target.display(),
                "source retired"
            ),
            Err(err) => warn!(
                task = task.id(),
                source = %task.source().display(),
                error = %err,
                "failed to retire source"
            ),
        }
    }

    fn publish(&self, result: &TaskResult) {
        let published = run_with_panic_policy("publish", || {
            self.sink.publish(result);
            Ok(())
        });
        if let Err(err) = published {
            error!(task = result.task_id, error = %err, "event sink failed");
        }
    }

    pub(crate) fn producer_finished(&self) {
        let mut core = self.lock();
        core.producer_done = true;
        self.check_drained(&mut core);
    }

    pub(crate) fn worker_exited(&self) {
        let mut core = self.lock();
        core.live_workers = core.live_workers.saturating_sub(1);
        self.changed.notify_all();
    }

    fn check_drained(&self, core: &mut RunCore) {
        if matches!(core.state, PoolState::Running | PoolState::Paused)
            && core.producer_done
            && core.active == 0
            && self.stats.outstanding() == 0
        {
            let was_paused = core.state == PoolState::Paused;
            core.state = PoolState::Idle;
            self.stats.settle();
            self.queue.close();
            self.changed.notify_all();
            let snap = self.stats.snapshot();
            info!(
                run = self.id,
                succeeded = snap.succeeded,
                failed = snap.failed,
                skipped = snap.skipped,
                elapsed_ms = snap.elapsed.as_millis() as u64,
                was_paused,
                "run drained"
            );
        }
    }

    fn pause(&self) -> Result<(), BatchError> {
        let mut core = self.lock();
        match core.state {
            PoolState::Running => {
                core.state = PoolState::Paused;
                info!(run = self.id, "paused");
                Ok(())
            }
            PoolState::Paused => Ok(()),
            other => Err(BatchError::invalid_state("pause", other.as_str())),
        }
    }

    fn resume(&self) -> Result<(), BatchError> {
        let mut core = self.lock();
        match core.state {
            PoolState::Paused => {
                core.state = PoolState::Running;
                self.changed.notify_all();
                info!(run = self.id, "resumed");
                Ok(())
            }
            PoolState::Running => Ok(()),
            other => Err(BatchError::invalid_state("resume", other.as_str())),
        }
    }

    /// Enter Draining and cancel unclaimed tasks. Does nothing unless the run
    /// is Running or Paused.
    fn begin_stop(&self) {
        {
            let mut core = self.lock();
            if !matches!(core.state, PoolState::Running | PoolState::Paused) {
                return;
            }
            core.state = PoolState::Draining;
            self.changed.notify_all();
        }
        self.queue.close();
        let discarded = self.queue.drain();
        for task in &discarded {
            self.record_unstarted(task);
        }
        info!(run = self.id, discarded = discarded.len(), "stopping");
    }

    /// Wait up to `grace` until every submitted task has a result, then
    /// settle in Stopped. Returns how many admitted tasks were still running.
    ///
    /// Claimed tasks that were never admitted (a worker parked in admit()
    /// while paused, or a producer push refused by the closed queue) are not
    /// in `active`; they count through `outstanding()` until recorded.
    fn await_stop(&self, grace: Duration) -> u64 {
        let deadline = Instant::now().checked_add(grace);
        let mut core = self.lock();
        while core.state == PoolState::Draining
            && (core.active > 0 || self.stats.outstanding() > 0)
        {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut core, deadline).timed_out() {
                        break;
                    }
                }
                None => self.changed.wait(&mut core),
            }
        }
        let still_running = core.active;
        if core.state == PoolState::Draining {
            core.state = PoolState::Stopped;
            self.stats.settle();
            self.changed.notify_all();
            if still_running > 0 {
                warn!(run = self.id, still_running, "grace period expired, abandoning running tasks");
            }
            info!(run = self.id, "stopped");
        }
        still_running
    }

    fn active(&self) -> u64 {
        self.lock().active
    }

    fn live_workers(&self) -> usize {
        self.lock().live_workers
    }

    fn wait_settled(&self, timeout: Option<Duration>) -> PoolState {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut core = self.lock();
        while !core.state.is_settled() {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut core, deadline).timed_out() {
                        break;
                    }
                }
                None => self.changed.wait(&mut core),
            }
        }
        core.state
    }
}

fn log_result(run: u64, result: &TaskResult) {
    let source = result.source.display();
    match result.failure_kind() {
        None => debug!(
            run,
            task = result.task_id,
            %source,
            elapsed_ms = result.duration.as_millis() as u64,
            bytes_in = result.bytes_in,
            bytes_out = result.bytes_out,
            "converted"
        ),
        Some(FailureKind::Cancelled) => trace!(run, task = result.task_id, %source, "cancelled"),
        Some(FailureKind::Conversion) => warn!(
            run,
            task = result.task_id,
            %source,
            error = result.error_message().unwrap_or_default(),
            "conversion failed"
        ),
        Some(FailureKind::InternalFault) => error!(
            run,
            task = result.task_id,
            %source,
            error = result.error_message().unwrap_or_default(),
            "worker fault"
        ),
    }
}

/// A stop that has drained the queue and is waiting on admitted tasks.
pub(crate) struct PendingStop {
    run: Arc<Run>,
    /// Cancelled count before the stop began
    cancelled_before: u64,
    in_flight: u64,
}

impl PendingStop {
    pub(crate) fn finish(self, grace: Duration) -> StopReport {
        let still_running = self.run.await_stop(grace);
        let cancelled = self.run.stats().snapshot().cancelled;
        StopReport {
            discarded: cancelled.saturating_sub(self.cancelled_before) as usize,
            in_flight: self.in_flight,
            still_running,
            timed_out: still_running > 0,
        }
    }
}

/// Owns the worker threads and drives one run at a time.
pub struct PoolController {
    config: PoolConfig,
    threads: ThreadPool,
    converter: Arc<dyn Converter>,
    retirer: Option<Arc<dyn SourceRetirer>>,
    sink: Arc<dyn EventSink>,
    current: Mutex<Option<Arc<Run>>>,
    runs: AtomicU64,
}

impl fmt::Debug for PoolController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolController")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl PoolController {
    pub fn new(config: PoolConfig, converter: Arc<dyn Converter>) -> Result<Self, BatchError> {
        config.validate()?;
        let threads = build_thread_pool(config.workers)?;
        debug!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "pool controller created"
        );
        Ok(Self {
            config,
            threads,
            converter,
            retirer: None,
            sink: Arc::new(NullSink),
            current: Mutex::new(None),
            runs: AtomicU64::new(0),
        })
    }

    /// Retire sources of successful tasks that ask for it.
    pub fn with_retirer(mut self, retirer: Arc<dyn SourceRetirer>) -> Self {
        self.retirer = Some(retirer);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Start a run fed by `feed`, pulled lazily on a producer thread.
    /// Feed errors are logged and counted as skipped.
    pub fn start<I>(&self, feed: I) -> Result<(), BatchError>
    where
        I: IntoIterator<Item = Result<Task, BatchError>>,
        I::IntoIter: Send + 'static,
    {
        let mut current = self.current.lock();
        if let Some(run) = current.as_ref() {
            let state = run.state();
            if !state.is_settled() {
                return Err(BatchError::invalid_state("start", state.as_str()));
            }
        }

        let id = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        let run = Arc::new(Run::new(id, &self.config, self));
        for index in 0..self.config.workers {
            let run = Arc::clone(&run);
            self.threads.spawn(move || run_worker(run, index));
        }

        let producer = Arc::clone(&run);
        let feed = feed.into_iter();
        let spawned = std::thread::Builder::new()
            .name(PRODUCER_THREAD_NAME.to_string())
            .spawn(move || run_producer(producer, feed));
        *current = Some(Arc::clone(&run));

        if let Err(e) = spawned {
            run.producer_finished();
            return Err(BatchError::internal_fault(format!(
                "failed to spawn producer thread: {e}"
            )));
        }
        info!(run = id, workers = self.config.workers, "run started");
        Ok(())
    }

    fn current_run(&self) -> Option<Arc<Run>> {
        self.current.lock().clone()
    }

    fn require_run(&self, operation: &'static str) -> Result<Arc<Run>, BatchError> {
        self.current_run()
            .ok_or_else(|| BatchError::invalid_state(operation, PoolState::Idle.as_str()))
    }

    /// Workers finish their current task and claim nothing new.
    pub fn pause(&self) -> Result<(), BatchError> {
        self.require_run("pause")?.pause()
    }

    pub fn resume(&self) -> Result<(), BatchError> {
        self.require_run("resume")?.resume()
    }

    /// Stop with the configured grace period.
    pub fn stop(&self) -> StopReport {
        self.stop_with_grace(self.config.stop_grace)
    }

    /// Cancel unclaimed tasks and wait up to `grace` for running ones.
    /// Idempotent: stopping a settled pool reports nothing.
    pub fn stop_with_grace(&self, grace: Duration) -> StopReport {
        match self.begin_stop() {
            Some(pending) => pending.finish(grace),
            None => StopReport::default(),
        }
    }

    pub(crate) fn begin_stop(&self) -> Option<PendingStop> {
        let run = self.current_run()?;
        let cancelled_before = run.stats().snapshot().cancelled;
        run.begin_stop();
        Some(PendingStop {
            in_flight: run.active(),
            run,
            cancelled_before,
        })
    }

    /// Add tasks to the current run, blocking while the queue is full.
    /// Returns how many were accepted.
    pub fn enqueue<I>(&self, tasks: I) -> Result<usize, BatchError>
    where
        I: IntoIterator<Item = Task>,
    {
        let run = self.require_run("enqueue")?;
        let mut accepted = 0;
        for task in tasks {
            run.submit(task)?;
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Add one task without blocking. A full queue is `Backpressure`.
    pub fn try_enqueue(&self, task: Task) -> Result<(), BatchError> {
        self.require_run("enqueue")?.try_submit(task)
    }

    /// Counters of the current (or most recent) run.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.current_run()
            .map(|run| run.stats().snapshot())
            .unwrap_or_default()
    }

    pub fn state(&self) -> PoolState {
        self.current_run()
            .map(|run| run.state())
            .unwrap_or(PoolState::Idle)
    }

    /// Block until the current run is Idle or Stopped.
    pub fn wait(&self) -> PoolState {
        match self.current_run() {
            Some(run) => run.wait_settled(None),
            None => PoolState::Idle,
        }
    }

    /// Like wait(), giving up after `timeout`. Returns the state observed.
    pub fn wait_timeout(&self, timeout: Duration) -> PoolState {
        match self.current_run() {
            Some(run) => run.wait_settled(Some(timeout)),
            None => PoolState::Idle,
        }
    }

    /// Unclaimed tasks in the current run's queue
    pub fn queue_len(&self) -> usize {
        self.current_run().map(|run| run.queue().len()).unwrap_or(0)
    }

    /// Most unclaimed tasks the current run's queue ever held
    pub fn queue_high_water(&self) -> usize {
        self.current_run()
            .map(|run| run.queue().high_water())
            .unwrap_or(0)
    }

    /// Worker loops of the current run that have not exited yet
    pub fn live_workers(&self) -> usize {
        self.current_run()
            .map(|run| run.live_workers())
            .unwrap_or(0)
    }
}

impl Drop for PoolController {
    fn drop(&mut self) {
        // release blocked workers and the producer; do not wait for them
        if let Some(run) = self.current.get_mut().take() {
            run.begin_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::converter::Converted;
    use crate::task::ConversionOptions;

    fn ok_converter() -> Arc<dyn Converter> {
        Arc::new(|_: &Task| -> Result<Converted, BatchError> {
            Ok(Converted {
                bytes_in: 2,
                bytes_out: 1,
            })
        })
    }

    fn tasks(n: usize) -> Vec<Result<Task, BatchError>> {
        (0..n)
            .map(|i| {
                Ok(Task::new(
                    format!("in/{i}.heic"),
                    format!("out/{i}.jpg"),
                    ConversionOptions::default(),
                ))
            })
            .collect()
    }

    fn controller(workers: usize, capacity: usize) -> PoolController {
        let config = PoolConfig::default()
            .with_workers(workers)
            .with_queue_capacity(capacity)
            .with_stop_grace(Duration::from_secs(5));
        PoolController::new(config, ok_converter()).unwrap()
    }

    #[test]
    fn test_new_pool_is_idle() {
        let pool = controller(2, 4);
        assert_eq!(pool.state(), PoolState::Idle);
        assert_eq!(pool.wait(), PoolState::Idle);
        assert_eq!(pool.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PoolConfig::default().with_workers(0);
        assert!(PoolController::new(config, ok_converter()).is_err());
    }

    #[test]
    fn test_control_calls_without_run() {
        let pool = controller(1, 1);
        assert!(matches!(pool.pause(), Err(BatchError::InvalidState { .. })));
        assert!(matches!(pool.resume(), Err(BatchError::InvalidState { .. })));
        assert_eq!(pool.stop(), StopReport::default());
    }

    #[test]
    fn test_run_completes_to_idle() {
        let pool = controller(3, 2);
        pool.start(tasks(10)).unwrap();
        assert_eq!(pool.wait(), PoolState::Idle);
        let snap = pool.snapshot();
        assert_eq!(snap.submitted, 10);
        assert_eq!(snap.succeeded, 10);
        assert_eq!(snap.in_flight, 0);
        assert!(pool.queue_high_water() <= 2);
    }

    #[test]
    fn test_empty_feed_settles_idle() {
        let pool = controller(2, 2);
        pool.start(Vec::new()).unwrap();
        assert_eq!(pool.wait(), PoolState::Idle);
        assert_eq!(pool.snapshot().submitted, 0);
    }

    #[test]
    fn test_feed_errors_are_skipped() {
        let pool = controller(2, 2);
        let mut feed = tasks(3);
        feed.push(Err(BatchError::discovery_failed("x", "denied")));
        pool.start(feed).unwrap();
        assert_eq!(pool.wait(), PoolState::Idle);
        let snap = pool.snapshot();
        assert_eq!(snap.succeeded, 3);
        assert_eq!(snap.skipped, 1);
    }

    #[test]
    fn test_restart_after_idle() {
        let pool = controller(2, 2);
        pool.start(tasks(2)).unwrap();
        pool.wait();
        pool.start(tasks(3)).unwrap();
        assert_eq!(pool.wait(), PoolState::Idle);
        // counters belong to the latest run
        assert_eq!(pool.snapshot().submitted, 3);
    }

    #[test]
    fn test_pause_resume_idempotent() {
        let gate = Arc::new(std::sync::Barrier::new(2));
        let worker_gate = Arc::clone(&gate);
        let slow: Arc<dyn Converter> = Arc::new(move |_: &Task| -> Result<Converted, BatchError> {
            worker_gate.wait();
            Ok(Converted::default())
        });
        let config = PoolConfig::default().with_workers(1).with_queue_capacity(1);
        let pool = PoolController::new(config, slow).unwrap();
        pool.start(tasks(1)).unwrap();
        pool.pause().unwrap();
        pool.pause().unwrap();
        assert_eq!(pool.state(), PoolState::Paused);
        pool.resume().unwrap();
        pool.resume().unwrap();
        gate.wait();
        assert_eq!(pool.wait(), PoolState::Idle);
    }

    #[test]
    fn test_pool_state_display() {
        assert_eq!(PoolState::Draining.to_string(), "Draining");
        assert!(PoolState::Stopped.is_settled());
        assert!(!PoolState::Paused.is_settled());
    }
}
