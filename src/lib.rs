// lib.rs
//
// lazy-batch: a batch image-conversion engine
//
// Design goals:
// - Bounded memory regardless of how many files are discovered
// - Exactly one recorded result per submitted task
// - Pause, resume and cooperative stop at any time
// - One bad file never halts the batch

pub mod config;
pub mod engine;
pub mod error;
pub mod task;

pub use config::{AdvancePolicy, BatchConfig, PoolConfig};
pub use engine::{
    BatchManager, BatchTotals, Converted, Converter, DestinationPlanner, Discovery, EventBuffer,
    EventSink, ExtensionScanner, ImageConverter, Job, JobId, JobSpec, JobStatus, NullSink,
    PoolController, PoolState, ScanSummary, SourceRetirer, StatsSnapshot, StopReport, TrashDir,
};
pub use error::{BatchError, ErrorCategory, PushError, Result};
pub use task::{
    ConversionOptions, FailureKind, Outcome, OutputFormat, Task, TaskId, TaskResult,
};
