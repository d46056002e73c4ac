// src/engine/pool.rs
//
// Worker Pool.
//
// Workers run on a rayon ThreadPool owned by the controller. The thread pool is
// sized once from PoolConfig and reused across runs; each run spawns exactly
// `workers` long-lived loops onto it. rayon's work stealing is not used: the
// loops pull from the bounded TaskQueue themselves.
//
// **Worker loop**:
//   wait while paused -> claim -> admit (re-check pause/stop) -> convert -> record
// A claimed task that is refused admission is recorded as Cancelled, so every
// task popped from the queue still gets exactly one result.
//
// **Producer**: one named std thread per run pulls the feed lazily and pushes
// into the queue, blocking while it is full.

use crate::engine::common::{panic_message, run_with_panic_policy};
use crate::engine::controller::Run;
use crate::engine::converter::Converter;
use crate::error::{BatchError, ErrorCategory};
use crate::task::{FailureKind, Task, TaskResult};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

pub(crate) const WORKER_THREAD_PREFIX: &str = "lazy-batch-worker";
pub(crate) const PRODUCER_THREAD_NAME: &str = "lazy-batch-producer";

pub(crate) fn build_thread_pool(workers: usize) -> Result<ThreadPool, BatchError> {
    ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|index| format!("{WORKER_THREAD_PREFIX}-{index}"))
        // rayon aborts on an unhandled panic in spawn(); worker loops already
        // catch converter panics, this covers anything left
        .panic_handler(|payload| {
            error!(panic = %panic_message(payload.as_ref()), "worker thread panicked");
        })
        .build()
        .map_err(|e| BatchError::internal_fault(format!("failed to build worker pool: {e}")))
}

/// Run one task through `converter` and build its result.
///
/// Never panics: converter panics become `FailureKind::InternalFault`.
pub fn execute(converter: &dyn Converter, task: &Task) -> TaskResult {
    let started = Instant::now();
    let outcome = run_with_panic_policy("convert", || converter.convert(task));
    let elapsed = started.elapsed();
    match outcome {
        Ok(converted) => {
            TaskResult::success(task, elapsed, converted.bytes_in, converted.bytes_out)
        }
        Err(err) => {
            let kind = match err.category() {
                ErrorCategory::InternalFault => FailureKind::InternalFault,
                _ => FailureKind::Conversion,
            };
            TaskResult::failure(task, kind, err.to_string(), elapsed)
        }
    }
}

pub(crate) fn run_worker(run: Arc<Run>, index: usize) {
    trace!(run = run.id(), worker = index, "worker started");
    let mut executed = 0u64;
    while run.wait_runnable() {
        let Some(task) = run.queue().pop() else {
            break;
        };
        if !run.admit() {
            run.record_unstarted(&task);
            break;
        }
        let result = execute(run.converter(), &task);
        run.finish(&task, result);
        executed += 1;
    }
    run.worker_exited();
    trace!(run = run.id(), worker = index, executed, "worker exited");
}

pub(crate) fn run_producer<I>(run: Arc<Run>, feed: I)
where
    I: Iterator<Item = Result<Task, BatchError>>,
{
    let mut submitted = 0u64;
    let mut skipped = 0u64;
    for item in feed {
        if !run.accepts_work() {
            break;
        }
        match item {
            Ok(task) => match run.submit(task) {
                Ok(()) => submitted += 1,
                Err(err) => {
                    debug!(run = run.id(), error = %err, "producer interrupted");
                    break;
                }
            },
            Err(err) => {
                skipped += 1;
                run.stats().record_skipped();
                warn!(run = run.id(), error = %err, "skipping entry");
            }
        }
    }
    run.producer_finished();
    debug!(run = run.id(), submitted, skipped, "producer finished");
}
