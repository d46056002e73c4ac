// src/error.rs
//
// Unified error handling for lazy-batch
// Uses thiserror for simple, type-safe error handling
//
// Error Taxonomy:
// - ConversionFailure: one task failed, recorded as a Failure result
// - DiscoveryError: a root or a single entry could not be enumerated
// - Backpressure: non-blocking push on a full queue
// - InvalidState: control call not allowed right now
// - InternalFault: a worker panicked, converted to a Failure result

use crate::task::Task;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Error taxonomy used by callers to decide how to react.
///
/// Per-task categories (`ConversionFailure`, `InternalFault`) never escape a
/// worker; they end up inside a `TaskResult`. The others are returned
/// synchronously from the control surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// A single conversion failed (non-fatal to the batch)
    ConversionFailure,
    /// Discovery of a root or an entry failed (entry is skipped)
    DiscoveryError,
    /// The queue is full and the caller asked not to block
    Backpressure,
    /// Illegal call for the current pool state or job status
    InvalidState,
    /// Unexpected fault inside a worker (should not happen)
    InternalFault,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ConversionFailure => "ConversionFailure",
            ErrorCategory::DiscoveryError => "DiscoveryError",
            ErrorCategory::Backpressure => "Backpressure",
            ErrorCategory::InvalidState => "InvalidState",
            ErrorCategory::InternalFault => "InternalFault",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// lazy-batch error types
#[derive(Debug, Error)]
pub enum BatchError {
    // Conversion Errors
    #[error("Source file not found: {path}")]
    SourceNotFound { path: Cow<'static, str> },

    #[error("Failed to read file '{path}': {source}")]
    ReadFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode '{path}': {message}")]
    DecodeFailed {
        path: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Failed to encode as {format}: {message}")]
    EncodeFailed {
        format: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Unsupported format for '{path}': {message}")]
    UnsupportedFormat {
        path: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Conversion of '{path}' failed: {message}")]
    ConversionFailed {
        path: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Discovery Errors
    #[error("Directory not found: {path}")]
    RootNotFound { path: Cow<'static, str> },

    #[error("Not a directory: {path}")]
    NotADirectory { path: Cow<'static, str> },

    #[error("Cannot access '{path}': {message}")]
    DiscoveryFailed {
        path: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Queue Errors
    #[error("Task queue is full (capacity {capacity})")]
    Backpressure { capacity: usize },

    #[error("Task queue is closed")]
    QueueClosed,

    // Control Errors
    #[error("Cannot {operation} while pool is {state}")]
    InvalidState {
        operation: Cow<'static, str>,
        state: Cow<'static, str>,
    },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: Cow<'static, str> },

    #[error("Unknown job: {id}")]
    JobNotFound { id: Cow<'static, str> },

    #[error("Invalid value for {name}: {value}. {reason}")]
    InvalidArgument {
        name: Cow<'static, str>,
        value: Cow<'static, str>,
        reason: Cow<'static, str>,
    },

    #[error("Invalid settings file '{path}': {message}")]
    InvalidSettings {
        path: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Internal Errors
    #[error("Internal error: {message}")]
    InternalFault { message: Cow<'static, str> },
}

// Constructor Helpers
impl BatchError {
    pub fn source_not_found(path: impl Into<Cow<'static, str>>) -> Self {
        Self::SourceNotFound { path: path.into() }
    }

    pub fn read_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::ReadFailed {
            path: path.into(),
            source,
        }
    }

    pub fn write_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::WriteFailed {
            path: path.into(),
            source,
        }
    }

    pub fn decode_failed(
        path: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::DecodeFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn encode_failed(
        format: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::EncodeFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn unsupported_format(
        path: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::UnsupportedFormat {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn conversion_failed(
        path: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::ConversionFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn root_not_found(path: impl Into<Cow<'static, str>>) -> Self {
        Self::RootNotFound { path: path.into() }
    }

    pub fn not_a_directory(path: impl Into<Cow<'static, str>>) -> Self {
        Self::NotADirectory { path: path.into() }
    }

    pub fn discovery_failed(
        path: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::DiscoveryFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn backpressure(capacity: usize) -> Self {
        Self::Backpressure { capacity }
    }

    pub fn queue_closed() -> Self {
        Self::QueueClosed
    }

    pub fn invalid_state(
        operation: impl Into<Cow<'static, str>>,
        state: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    pub fn job_not_found(id: impl Into<Cow<'static, str>>) -> Self {
        Self::JobNotFound { id: id.into() }
    }

    pub fn invalid_argument(
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_settings(
        path: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidSettings {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn internal_fault(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InternalFault {
            message: message.into(),
        }
    }

    /// Get the error category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SourceNotFound { .. }
            | Self::ReadFailed { .. }
            | Self::WriteFailed { .. }
            | Self::DecodeFailed { .. }
            | Self::EncodeFailed { .. }
            | Self::UnsupportedFormat { .. }
            | Self::ConversionFailed { .. } => ErrorCategory::ConversionFailure,

            Self::RootNotFound { .. }
            | Self::NotADirectory { .. }
            | Self::DiscoveryFailed { .. } => ErrorCategory::DiscoveryError,

            Self::Backpressure { .. } => ErrorCategory::Backpressure,

            // queue closes only on stop
            Self::QueueClosed
            | Self::InvalidState { .. }
            | Self::InvalidOperation { .. }
            | Self::JobNotFound { .. }
            | Self::InvalidArgument { .. }
            | Self::InvalidSettings { .. } => ErrorCategory::InvalidState,

            Self::InternalFault { .. } => ErrorCategory::InternalFault,
        }
    }

    /// Whether this error belongs inside a `TaskResult` rather than being
    /// returned to a control-surface caller.
    pub fn is_per_task(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::ConversionFailure | ErrorCategory::InternalFault
        )
    }
}

/// Rejected push. The task is handed back so the caller can retry or
/// account for it.
#[derive(Debug, Error)]
pub enum PushError {
    /// Queue held `capacity` unclaimed tasks
    #[error("queue full, task {} rejected", .0.id())]
    Full(Task),
    /// Queue was closed before the task could be accepted
    #[error("queue closed, task {} rejected", .0.id())]
    Closed(Task),
}

impl PushError {
    pub fn into_task(self) -> Task {
        match self {
            PushError::Full(task) | PushError::Closed(task) => task,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PushError::Closed(_))
    }

    /// Convert into the control-surface error, dropping the task.
    pub fn into_error(self, capacity: usize) -> BatchError {
        match self {
            PushError::Full(_) => BatchError::backpressure(capacity),
            PushError::Closed(_) => BatchError::queue_closed(),
        }
    }
}

// Result type alias
pub type Result<T> = std::result::Result<T, BatchError>;
