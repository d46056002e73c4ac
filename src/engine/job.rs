// src/engine/job.rs
//
// Job model: one root directory converted as a unit, plus destination planning.

use crate::config::BatchConfig;
use crate::engine::stats::StatsSnapshot;
use crate::error::BatchError;
use crate::task::{ConversionOptions, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    /// Discovery of the root failed before any task ran
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Paused => "Paused",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to convert and where the results go.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub root: PathBuf,
    /// None writes each output next to its source
    pub output_dir: Option<PathBuf>,
    /// Mirror the source tree below `output_dir`; otherwise flatten
    pub preserve_structure: bool,
    pub options: ConversionOptions,
}

impl JobSpec {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            output_dir: None,
            preserve_structure: true,
            options: ConversionOptions::default(),
        }
    }

    /// Spec for `root` using the output settings in `config`.
    pub fn from_config(root: impl Into<PathBuf>, config: &BatchConfig) -> Self {
        Self {
            root: root.into(),
            output_dir: config.output_dir.clone(),
            preserve_structure: config.preserve_structure,
            options: config.conversion.clone(),
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_preserve_structure(mut self, preserve: bool) -> Self {
        self.preserve_structure = preserve;
        self
    }

    pub fn with_options(mut self, options: ConversionOptions) -> Self {
        self.options = options;
        self
    }

    /// Output path for `source`: the source stem with the format's extension.
    ///
    /// With an output directory and `preserve_structure`, the source's
    /// directory relative to `root` is recreated below it. Sources outside
    /// `root` are flattened.
    pub fn destination_for(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| "output".into());
        let mut file_name = stem;
        file_name.push(".");
        file_name.push(self.options.format.extension());

        match &self.output_dir {
            None => source.with_file_name(file_name),
            Some(out) => {
                let relative = if self.preserve_structure {
                    source
                        .parent()
                        .and_then(|parent| parent.strip_prefix(&self.root).ok())
                } else {
                    None
                };
                match relative {
                    Some(relative) => out.join(relative).join(file_name),
                    None => out.join(file_name),
                }
            }
        }
    }

    pub fn task_for(&self, source: &Path) -> Task {
        Task::new(source, self.destination_for(source), self.options.clone())
    }
}

/// Hands out destinations across a batch so that no two planned tasks write
/// the same file and no task writes over its own source. A clash gets a
/// numeric suffix: `IMG_0001.jpg`, `IMG_0001.1.jpg`, `IMG_0001.2.jpg`.
///
/// Existing files are only treated as taken when their extension is one of
/// the protected source extensions, since discovery may hand them out as
/// sources. Any other existing output is replaced, so re-running a batch
/// overwrites the previous run's results.
#[derive(Debug, Default)]
pub struct DestinationPlanner {
    claimed: HashSet<PathBuf>,
    protected: Vec<String>,
}

impl DestinationPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never write over an existing file with one of these extensions
    /// (case-insensitive; a leading dot is ignored).
    pub fn protecting<I, S>(mut self, source_extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.protected = source_extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        self
    }

    pub fn plan(&mut self, spec: &JobSpec, source: &Path) -> Task {
        let destination = self.claim(spec.destination_for(source), source);
        Task::new(source, destination, spec.options.clone())
    }

    /// Destinations handed out so far
    pub fn claimed(&self) -> usize {
        self.claimed.len()
    }

    fn is_free(&self, candidate: &Path, source: &Path) -> bool {
        candidate != source
            && !self.claimed.contains(candidate)
            && !(self.is_protected(candidate) && candidate.exists())
    }

    fn is_protected(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.protected.iter().any(|p| p.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    fn claim(&mut self, preferred: PathBuf, source: &Path) -> PathBuf {
        if self.is_free(&preferred, source) {
            self.claimed.insert(preferred.clone());
            return preferred;
        }

        let stem = preferred
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let ext = preferred
            .extension()
            .map(|e| e.to_string_lossy().into_owned());
        let free = (1u64..)
            .map(|n| match &ext {
                Some(ext) => preferred.with_file_name(format!("{stem}.{n}.{ext}")),
                None => preferred.with_file_name(format!("{stem}.{n}")),
            })
            .find(|candidate| self.is_free(candidate, source))
            .unwrap_or(preferred);
        self.claimed.insert(free.clone());
        free
    }
}

/// Most per-entry discovery errors kept on a job; later ones are only counted.
pub const MAX_SCAN_ERRORS: usize = 100;

/// What discovery found under a job's root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Matching files handed to the pool
    pub files: u64,
    /// Combined size of those files
    pub bytes: u64,
    /// Entries that could not be read
    pub error_count: u64,
    /// Messages for the first MAX_SCAN_ERRORS of them
    pub errors: Vec<String>,
}

impl ScanSummary {
    pub(crate) fn record_file(&mut self, source: &Path) {
        self.files += 1;
        self.bytes += std::fs::metadata(source).map(|m| m.len()).unwrap_or(0);
    }

    pub(crate) fn record_error(&mut self, err: &BatchError) {
        self.error_count += 1;
        if self.errors.len() < MAX_SCAN_ERRORS {
            self.errors.push(err.to_string());
        }
    }
}

/// A job tracked by the Batch Manager.
#[derive(Clone, Debug, Serialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Live while active; frozen once terminal
    pub stats: StatsSnapshot,
    pub scan: ScanSummary,
    pub error: Option<String>,
}

impl Job {
    pub(crate) fn new(spec: JobSpec) -> Self {
        Self {
            id: JobId::new(),
            spec,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stats: StatsSnapshot::default(),
            scan: ScanSummary::default(),
            error: None,
        }
    }

    /// Completed fraction of the tasks submitted so far (0.0-1.0)
    pub fn progress(&self) -> f64 {
        if self.status == JobStatus::Completed {
            return 1.0;
        }
        match self.stats.submitted {
            0 => 0.0,
            n => self.stats.completed() as f64 / n as f64,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.finished_at.unwrap_or_else(Utc::now) - started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::OutputFormat;

    #[test]
    fn test_destination_next_to_source() {
        let spec = JobSpec::new("/photos");
        assert_eq!(
            spec.destination_for(Path::new("/photos/2024/IMG_0001.HEIC")),
            PathBuf::from("/photos/2024/IMG_0001.jpg")
        );
    }

    #[test]
    fn test_destination_preserves_structure() {
        let spec = JobSpec::new("/photos").with_output_dir("/out");
        assert_eq!(
            spec.destination_for(Path::new("/photos/2024/trip/IMG_0001.heic")),
            PathBuf::from("/out/2024/trip/IMG_0001.jpg")
        );
        assert_eq!(
            spec.destination_for(Path::new("/photos/top.heic")),
            PathBuf::from("/out/top.jpg")
        );
    }

    #[test]
    fn test_destination_flattened() {
        let spec = JobSpec::new("/photos")
            .with_output_dir("/out")
            .with_preserve_structure(false);
        assert_eq!(
            spec.destination_for(Path::new("/photos/2024/trip/a.heic")),
            PathBuf::from("/out/a.jpg")
        );
    }

    #[test]
    fn test_destination_outside_root_is_flattened() {
        let spec = JobSpec::new("/photos").with_output_dir("/out");
        assert_eq!(
            spec.destination_for(Path::new("/elsewhere/x/a.heic")),
            PathBuf::from("/out/a.jpg")
        );
    }

    #[test]
    fn test_destination_uses_format_extension() {
        let spec = JobSpec::new("/p").with_options(ConversionOptions {
            format: OutputFormat::WebP,
            ..ConversionOptions::default()
        });
        assert_eq!(
            spec.destination_for(Path::new("/p/a.b.heic")),
            PathBuf::from("/p/a.b.webp")
        );
    }

    #[test]
    fn test_task_for_carries_options() {
        let options = ConversionOptions {
            quality: 42,
            ..ConversionOptions::default()
        };
        let spec = JobSpec::new("/p").with_options(options.clone());
        let task = spec.task_for(Path::new("/p/a.heic"));
        assert_eq!(task.options(), &options);
        assert_eq!(task.destination(), Path::new("/p/a.jpg"));
    }

    #[test]
    fn test_planner_suffixes_flattened_clashes() {
        let spec = JobSpec::new("/dcim")
            .with_output_dir("/out")
            .with_preserve_structure(false);
        let mut planner = DestinationPlanner::new();
        let first = planner.plan(&spec, Path::new("/dcim/100APPLE/IMG_0001.HEIC"));
        let second = planner.plan(&spec, Path::new("/dcim/101APPLE/IMG_0001.HEIC"));
        let third = planner.plan(&spec, Path::new("/dcim/102APPLE/IMG_0001.heic"));
        assert_eq!(first.destination(), Path::new("/out/IMG_0001.jpg"));
        assert_eq!(second.destination(), Path::new("/out/IMG_0001.1.jpg"));
        assert_eq!(third.destination(), Path::new("/out/IMG_0001.2.jpg"));
        assert_eq!(planner.claimed(), 3);
    }

    #[test]
    fn test_planner_skips_taken_suffix() {
        let spec = JobSpec::new("/p")
            .with_output_dir("/out")
            .with_preserve_structure(false);
        let mut planner = DestinationPlanner::new();
        planner.plan(&spec, Path::new("/p/a/x.1.heic"));
        planner.plan(&spec, Path::new("/p/a/x.heic"));
        let clash = planner.plan(&spec, Path::new("/p/b/x.heic"));
        assert_eq!(clash.destination(), Path::new("/out/x.2.jpg"));
    }

    #[test]
    fn test_planner_never_targets_the_source() {
        let spec = JobSpec::new("/p");
        let mut planner = DestinationPlanner::new();
        let task = planner.plan(&spec, Path::new("/p/shot.jpg"));
        assert_eq!(task.destination(), Path::new("/p/shot.1.jpg"));
    }

    #[test]
    fn test_planner_protects_other_sources_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("shot.png");
        let jpg = dir.path().join("shot.jpg");
        std::fs::write(&png, b"png").unwrap();
        std::fs::write(&jpg, b"jpg").unwrap();

        let spec = JobSpec::new(dir.path());
        let mut planner = DestinationPlanner::new().protecting(["PNG", ".jpg"]);
        // shot.jpg exists and could be discovered as a source itself
        let from_png = planner.plan(&spec, &png);
        assert_eq!(from_png.destination(), dir.path().join("shot.1.jpg"));
        let from_jpg = planner.plan(&spec, &jpg);
        assert_eq!(from_jpg.destination(), dir.path().join("shot.2.jpg"));

        // without protection an existing output is simply replaced
        let mut unprotected = DestinationPlanner::new();
        assert_eq!(unprotected.plan(&spec, &png).destination(), jpg);
    }

    #[test]
    fn test_scan_summary_caps_messages() {
        let mut scan = ScanSummary::default();
        for n in 0..MAX_SCAN_ERRORS + 5 {
            scan.record_error(&BatchError::discovery_failed(format!("/p/{n}"), "denied"));
        }
        scan.record_file(Path::new("/definitely/not/here.heic"));
        assert_eq!(scan.error_count, MAX_SCAN_ERRORS as u64 + 5);
        assert_eq!(scan.errors.len(), MAX_SCAN_ERRORS);
        assert_eq!(scan.files, 1);
        assert_eq!(scan.bytes, 0);
    }

    #[test]
    fn test_progress() {
        let mut job = Job::new(JobSpec::new("/p"));
        assert_eq!(job.progress(), 0.0);
        job.stats.submitted = 4;
        job.stats.succeeded = 1;
        job.stats.failed = 1;
        assert_eq!(job.progress(), 0.5);
        job.status = JobStatus::Completed;
        assert_eq!(job.progress(), 1.0);
    }

    #[test]
    fn test_status_predicates() {
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(JobStatus::Paused.is_active());
        assert!(!JobStatus::Completed.is_active());
    }
}
