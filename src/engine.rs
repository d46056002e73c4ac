// src/engine.rs
//
// The core of lazy-batch. A bounded producer/consumer pipeline that:
// 1. Pulls sources lazily from discovery into a bounded queue
// 2. Converts them on a fixed set of worker threads
// 3. Records exactly one result per submitted task
//
// This file is a facade over the modules in engine/

// =============================================================================
// SECURITY LIMITS
// =============================================================================

/// Maximum allowed image dimension (width or height) accepted by ImageConverter.
/// Larger images are rejected before decoding to prevent decompression bombs.
pub const MAX_DIMENSION: u32 = 32768;

/// Maximum allowed total pixels (width * height).
pub const MAX_PIXELS: u64 = 100_000_000;

// =============================================================================
// MODULE DECOMPOSITION
// =============================================================================

mod batch;
mod common;
mod controller;
mod converter;
mod discovery;
mod events;
mod heif;
mod job;
mod metadata;
mod pool;
mod queue;
mod retire;
mod stats;

pub use batch::{BatchManager, BatchTotals};
pub use common::run_with_panic_policy;
pub use controller::{PoolController, PoolState, StopReport};
pub use converter::{
    check_dimensions, convert_bytes, encode, write_atomically, Converted, Converter,
    ImageConverter,
};
pub use discovery::{validate_root, Discovery, ExtensionScanner, PathStream};
pub use events::{EventBuffer, EventSink, NullSink};
pub use heif::is_heif;
pub use job::{DestinationPlanner, Job, JobId, JobSpec, JobStatus, ScanSummary, MAX_SCAN_ERRORS};
pub use metadata::Metadata;
pub use pool::execute;
pub use queue::TaskQueue;
pub use retire::{SourceRetirer, TrashDir};
pub use stats::{Statistics, StatsSnapshot};

/// EXIF/ICC helpers
pub mod meta {
    pub use super::metadata::{embed, extract};
}
