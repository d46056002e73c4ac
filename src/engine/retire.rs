// src/engine/retire.rs
//
// Moves a converted source to a recoverable location.
// Only called after a Success result has been recorded for the task.

use crate::error::BatchError;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

pub trait SourceRetirer: Send + Sync {
    /// Returns where the source ended up.
    fn retire(&self, source: &Path) -> Result<PathBuf, BatchError>;
}

/// Moves sources into a flat trash directory. Name clashes get a numeric
/// suffix; an existing file is never overwritten.
#[derive(Debug)]
pub struct TrashDir {
    root: PathBuf,
    // serializes name selection + rename across workers
    guard: Mutex<()>,
}

impl TrashDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn free_target(&self, source: &Path) -> PathBuf {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let candidate = self.root.join(&file_name);
        if !candidate.exists() {
            return candidate;
        }

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());
        let ext = source.extension().map(|e| e.to_string_lossy().into_owned());
        (1u64..)
            .map(|n| match &ext {
                Some(ext) => self.root.join(format!("{stem}.{n}.{ext}")),
                None => self.root.join(format!("{stem}.{n}")),
            })
            .find(|candidate| !candidate.exists())
            .unwrap_or(candidate)
    }
}

impl SourceRetirer for TrashDir {
    fn retire(&self, source: &Path) -> Result<PathBuf, BatchError> {
        if !source.exists() {
            return Err(BatchError::source_not_found(source.display().to_string()));
        }
        let _guard = self.guard.lock();
        fs::create_dir_all(&self.root)
            .map_err(|e| BatchError::write_failed(self.root.display().to_string(), e))?;

        let target = self.free_target(source);
        if fs::rename(source, &target).is_ok() {
            return Ok(target);
        }

        // rename fails across filesystems; copy then remove
        fs::copy(source, &target)
            .map_err(|e| BatchError::write_failed(target.display().to_string(), e))?;
        if let Err(e) = fs::remove_file(source) {
            let _ = fs::remove_file(&target);
            return Err(BatchError::write_failed(source.display().to_string(), e));
        }
        Ok(target)
    }
}
