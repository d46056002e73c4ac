// src/task.rs
//
// Units of work and their outcomes.
// Tasks are cheap, immutable descriptions; the expensive work happens in a worker.

use crate::error::{BatchError, ErrorCategory};
use chrono::{DateTime, Utc};
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

fn next_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Output format for encoding
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
    WebP,
}

impl OutputFormat {
    pub fn parse(format: &str) -> Result<Self, BatchError> {
        match format.to_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::WebP),
            other => Err(BatchError::invalid_argument(
                "format",
                other.to_string(),
                "Expected jpeg, png or webp",
            )),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
        }
    }

    pub(crate) fn image_format(&self) -> ImageFormat {
        match self {
            OutputFormat::Jpeg => ImageFormat::Jpeg,
            OutputFormat::Png => ImageFormat::Png,
            OutputFormat::WebP => ImageFormat::WebP,
        }
    }
}

/// Pass-through options handed to the converter untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    pub format: OutputFormat,
    /// Encoder quality (0-100). Ignored by lossless formats.
    pub quality: u8,
    /// Carry EXIF from the source into the output where the format allows it
    pub preserve_metadata: bool,
    /// Move the source to the trash after a recorded success
    pub retire_source: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Jpeg,
            quality: 90,
            preserve_metadata: true,
            retire_source: false,
        }
    }
}

impl ConversionOptions {
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.quality > 100 {
            return Err(BatchError::invalid_argument(
                "quality",
                self.quality.to_string(),
                "Quality must be between 0 and 100",
            ));
        }
        Ok(())
    }
}

/// One file's conversion request. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    id: TaskId,
    source: PathBuf,
    destination: PathBuf,
    options: ConversionOptions,
}

impl Task {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        options: ConversionOptions,
    ) -> Self {
        Self {
            id: next_task_id(),
            source: source.into(),
            destination: destination.into(),
            options,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn options(&self) -> &ConversionOptions {
        &self.options
    }
}

/// Why a task failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The converter reported a failure
    Conversion,
    /// The task was still queued when the pool stopped; it never started
    Cancelled,
    /// The worker panicked while running the task
    InternalFault,
}

impl FailureKind {
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            FailureKind::Conversion => Some(ErrorCategory::ConversionFailure),
            FailureKind::InternalFault => Some(ErrorCategory::InternalFault),
            FailureKind::Cancelled => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure { kind: FailureKind, message: String },
}

/// Recorded outcome of one task. Created exactly once per task, by the
/// worker that executed it (or by the controller for tasks discarded on stop).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub duration: Duration,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task: &Task, duration: Duration, bytes_in: u64, bytes_out: u64) -> Self {
        Self {
            task_id: task.id(),
            source: task.source().to_path_buf(),
            destination: Some(task.destination().to_path_buf()),
            outcome: Outcome::Success,
            duration,
            bytes_in,
            bytes_out,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        task: &Task,
        kind: FailureKind,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task.id(),
            source: task.source().to_path_buf(),
            destination: None,
            outcome: Outcome::Failure {
                kind,
                message: message.into(),
            },
            duration,
            bytes_in: 0,
            bytes_out: 0,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn cancelled(task: &Task) -> Self {
        Self::failure(
            task,
            FailureKind::Cancelled,
            "stopped before start",
            Duration::ZERO,
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            Outcome::Success => None,
            Outcome::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Success => None,
            Outcome::Failure { message, .. } => Some(message),
        }
    }

    /// Output size relative to input size (successes only)
    pub fn compression_ratio(&self) -> Option<f64> {
        if self.is_success() && self.bytes_in > 0 && self.bytes_out > 0 {
            Some(self.bytes_out as f64 / self.bytes_in as f64)
        } else {
            None
        }
    }

    /// Bytes saved by the conversion; negative when the output grew
    pub fn bytes_saved(&self) -> Option<i64> {
        self.compression_ratio()
            .map(|_| self.bytes_in as i64 - self.bytes_out as i64)
    }
}
