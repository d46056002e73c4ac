// src/engine/stats.rs
//
// Statistics Aggregator.
//
// All counters live behind one lock so snapshot() observes a single logical
// instant. Derived metrics (throughput, ETA) are computed from snapshots and
// never stored.

use crate::task::{FailureKind, TaskResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Counters {
    submitted: u64,
    in_flight: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    skipped: u64,
    bytes_in: u64,
    bytes_out: u64,
    busy: Duration,
    last_update: Option<Instant>,
    settled: Option<Instant>,
}

/// Point-in-time copy of the counters.
///
/// Invariants: `succeeded + failed <= submitted` and
/// `submitted - succeeded - failed - in_flight == queued()`.
/// `cancelled` is the subset of `failed` that never started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Discovery entries that could not be turned into tasks
    pub skipped: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Sum of per-task execution time across all workers
    pub busy: Duration,
    /// Wall clock since the aggregator was created, frozen once the run settles
    pub elapsed: Duration,
    /// Wall clock from creation to the most recent update
    pub last_update: Duration,
}

impl StatsSnapshot {
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Submitted but not yet claimed by a worker
    pub fn queued(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed())
            .saturating_sub(self.in_flight)
    }

    /// Submitted but without a result yet
    pub fn remaining(&self) -> u64 {
        self.submitted.saturating_sub(self.completed())
    }

    /// Completed tasks per second of wall clock
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.completed() as f64 / secs
        } else {
            0.0
        }
    }

    /// Time left for the tasks submitted so far at the current throughput
    pub fn eta(&self) -> Option<Duration> {
        let rate = self.throughput();
        if rate > 0.0 {
            Some(Duration::from_secs_f64(self.remaining() as f64 / rate))
        } else {
            None
        }
    }

    /// Fraction of completed tasks that succeeded (0.0-1.0)
    pub fn success_rate(&self) -> f64 {
        match self.completed() {
            0 => 0.0,
            n => self.succeeded as f64 / n as f64,
        }
    }

    pub fn average_task_time(&self) -> Option<Duration> {
        let executed = self.completed().saturating_sub(self.cancelled);
        if executed == 0 {
            return None;
        }
        Some(self.busy / executed.min(u32::MAX as u64) as u32)
    }

    pub fn bytes_saved(&self) -> i64 {
        self.bytes_in as i64 - self.bytes_out as i64
    }

    /// Add another snapshot's counters into this one (used for batch totals)
    pub fn accumulate(&mut self, other: &StatsSnapshot) {
        self.submitted += other.submitted;
        self.in_flight += other.in_flight;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.skipped += other.skipped;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.busy += other.busy;
        self.elapsed += other.elapsed;
        self.last_update += other.last_update;
    }
}

/// Thread-safe running counters for one run of the pool.
#[derive(Debug)]
pub struct Statistics {
    started: Instant,
    counters: Mutex<Counters>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn task_submitted(&self) {
        let mut c = self.counters.lock();
        c.submitted += 1;
        c.last_update = Some(Instant::now());
    }

    pub fn task_started(&self) {
        let mut c = self.counters.lock();
        c.in_flight += 1;
        c.last_update = Some(Instant::now());
    }

    /// Record a result. Cancelled results never started, so they do not
    /// release an in-flight slot.
    pub fn record(&self, result: &TaskResult) {
        let mut c = self.counters.lock();
        match result.failure_kind() {
            None => {
                c.succeeded += 1;
                c.bytes_in += result.bytes_in;
                c.bytes_out += result.bytes_out;
            }
            Some(FailureKind::Cancelled) => {
                c.failed += 1;
                c.cancelled += 1;
            }
            Some(_) => c.failed += 1,
        }
        if result.failure_kind() != Some(FailureKind::Cancelled) {
            c.in_flight = c.in_flight.saturating_sub(1);
            c.busy += result.duration;
        }
        c.last_update = Some(Instant::now());
    }

    pub fn record_skipped(&self) {
        let mut c = self.counters.lock();
        c.skipped += 1;
        c.last_update = Some(Instant::now());
    }

    /// Stop the wall clock. Later calls keep the first settle time.
    pub fn settle(&self) {
        let mut c = self.counters.lock();
        if c.settled.is_none() {
            c.settled = Some(Instant::now());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.counters.lock();
        StatsSnapshot {
            submitted: c.submitted,
            in_flight: c.in_flight,
            succeeded: c.succeeded,
            failed: c.failed,
            cancelled: c.cancelled,
            skipped: c.skipped,
            bytes_in: c.bytes_in,
            bytes_out: c.bytes_out,
            busy: c.busy,
            elapsed: c
                .settled
                .map(|t| t.duration_since(self.started))
                .unwrap_or_else(|| self.started.elapsed()),
            last_update: c
                .last_update
                .map(|t| t.duration_since(self.started))
                .unwrap_or_default(),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.counters.lock().in_flight
    }

    /// Submitted tasks still waiting for a result
    pub fn outstanding(&self) -> u64 {
        let c = self.counters.lock();
        c.submitted.saturating_sub(c.succeeded + c.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ConversionOptions, Task};
    use std::sync::Arc;
    use std::thread;

    fn task() -> Task {
        Task::new("a.heic", "a.jpg", ConversionOptions::default())
    }

    #[test]
    fn test_record_success_and_failure() {
        let stats = Statistics::new();
        let t = task();
        for _ in 0..3 {
            stats.task_submitted();
        }
        stats.task_started();
        stats.task_started();
        stats.record(&TaskResult::success(&t, Duration::from_millis(10), 100, 40));
        stats.record(&TaskResult::failure(
            &t,
            FailureKind::Conversion,
            "bad",
            Duration::from_millis(10),
        ));

        let snap = stats.snapshot();
        assert_eq!(snap.submitted, 3);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.queued(), 1);
        assert_eq!(snap.bytes_saved(), 60);
        assert_eq!(snap.average_task_time(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_cancelled_does_not_touch_in_flight() {
        let stats = Statistics::new();
        stats.task_submitted();
        stats.task_submitted();
        stats.task_started();
        stats.record(&TaskResult::cancelled(&task()));

        let snap = stats.snapshot();
        assert_eq!(snap.in_flight, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.cancelled, 1);
        assert_eq!(snap.queued(), 0);
        assert_eq!(stats.outstanding(), 1);
    }

    #[test]
    fn test_derived_metrics_on_empty_snapshot() {
        let snap = StatsSnapshot::default();
        assert_eq!(snap.throughput(), 0.0);
        assert_eq!(snap.eta(), None);
        assert_eq!(snap.success_rate(), 0.0);
        assert_eq!(snap.average_task_time(), None);
    }

    #[test]
    fn test_eta_from_throughput() {
        let snap = StatsSnapshot {
            submitted: 30,
            succeeded: 10,
            elapsed: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(snap.throughput(), 1.0);
        assert_eq!(snap.eta(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_settle_freezes_elapsed() {
        let stats = Statistics::new();
        stats.task_submitted();
        stats.task_started();
        stats.record(&TaskResult::success(&task(), Duration::ZERO, 1, 1));
        stats.settle();
        let first = stats.snapshot();
        thread::sleep(Duration::from_millis(20));
        stats.settle();
        let later = stats.snapshot();
        assert_eq!(first.elapsed, later.elapsed);
        assert_eq!(first.throughput(), later.throughput());
    }

    #[test]
    fn test_concurrent_records_are_consistent() {
        let stats = Arc::new(Statistics::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    let t = task();
                    for n in 0..500 {
                        stats.task_submitted();
                        stats.task_started();
                        let result = if (worker + n) % 5 == 0 {
                            TaskResult::failure(&t, FailureKind::Conversion, "x", Duration::ZERO)
                        } else {
                            TaskResult::success(&t, Duration::ZERO, 1, 1)
                        };
                        stats.record(&result);
                        let snap = stats.snapshot();
                        assert!(snap.completed() <= snap.submitted);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.submitted, 4000);
        assert_eq!(snap.completed(), 4000);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.failed, 800);
    }
}
