// src/config.rs
//
// Pool sizing and batch settings.
//
// **Worker Count Calculation**:
// - Uses std::thread::available_parallelism() to respect cgroup/CPU quota
// - Conversions are I/O bound (disk read/write dominates), so we oversubscribe:
//   min(32, 2 x cores)
// - Fallback is MIN_WORKERS when detection fails
//
// The pool itself always receives an explicit count; detection lives here.

use crate::engine::ImageConverter;
use crate::error::BatchError;
use crate::task::ConversionOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on concurrent workers
pub const MAX_WORKERS: usize = 32;

/// Lower bound on concurrent workers
pub const MIN_WORKERS: usize = 1;

/// Default number of unclaimed tasks the queue may hold
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default number of unread results kept by the event buffer
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default grace period for stop()
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

const ENV_WORKERS: &str = "LAZY_BATCH_WORKERS";
const ENV_QUEUE_CAPACITY: &str = "LAZY_BATCH_QUEUE_CAPACITY";
const ENV_STOP_GRACE_MS: &str = "LAZY_BATCH_STOP_GRACE_MS";

/// Worker count for a given number of logical cores.
pub fn worker_count_for(cores: usize) -> usize {
    cores
        .saturating_mul(2)
        .clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Worker count for this machine.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS);
    worker_count_for(cores)
}

/// Settings for one Pool Controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    #[serde(with = "duration_ms", rename = "stop_grace_ms")]
    pub stop_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.workers) {
            return Err(BatchError::invalid_argument(
                "workers",
                self.workers.to_string(),
                format!("must be between {MIN_WORKERS} and {MAX_WORKERS}"),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(BatchError::invalid_argument(
                "queue_capacity",
                "0",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// What the Batch Manager does after the current job is stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvancePolicy {
    /// Mark the job Cancelled and move on to the next queued job
    #[default]
    Continue,
    /// Mark the job Cancelled and leave the remaining jobs queued
    Halt,
}

/// Full settings for a batch session. Persisted as JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub pool: PoolConfig,
    pub event_capacity: usize,
    pub on_cancel: AdvancePolicy,
    pub conversion: ConversionOptions,
    /// File extensions picked up by discovery (case-insensitive, no dot)
    pub extensions: Vec<String>,
    /// None writes next to each source
    pub output_dir: Option<PathBuf>,
    /// Mirror the source tree below `output_dir`
    pub preserve_structure: bool,
    /// Recoverable location for retired sources
    pub trash_dir: Option<PathBuf>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            on_cancel: AdvancePolicy::Continue,
            conversion: ConversionOptions::default(),
            extensions: ImageConverter::decodable_extensions()
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            output_dir: None,
            preserve_structure: true,
            trash_dir: None,
        }
    }
}

impl BatchConfig {
    /// Load settings from a JSON file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(BatchError::read_failed(path.display().to_string(), e)),
        };
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            BatchError::invalid_settings(path.display().to_string(), e.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save settings as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), BatchError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| BatchError::write_failed(parent.display().to_string(), e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BatchError::internal_fault(format!("settings serialization: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| BatchError::write_failed(path.display().to_string(), e))
    }

    /// Apply LAZY_BATCH_* environment overrides. Unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse = |key: &str| lookup(key).and_then(|raw| raw.trim().parse::<u64>().ok());
        if let Some(workers) = parse(ENV_WORKERS) {
            self.pool.workers = workers as usize;
        }
        if let Some(capacity) = parse(ENV_QUEUE_CAPACITY) {
            self.pool.queue_capacity = capacity as usize;
        }
        if let Some(ms) = parse(ENV_STOP_GRACE_MS) {
            self.pool.stop_grace = Duration::from_millis(ms);
        }
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        self.pool.validate()?;
        self.conversion.validate()?;
        if self.event_capacity == 0 {
            return Err(BatchError::invalid_argument(
                "event_capacity",
                "0",
                "must be at least 1",
            ));
        }
        if self.extensions.is_empty() {
            return Err(BatchError::invalid_argument(
                "extensions",
                "[]",
                "at least one extension is required",
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
