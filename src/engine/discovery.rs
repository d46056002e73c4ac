// src/engine/discovery.rs
//
// Lazily enumerates candidate source files under a root directory.
//
// The stream is pulled by the producer thread one entry at a time, so a tree
// of any size never has to be materialized. Per-entry errors (permission
// denied, vanished files) are yielded in-band and counted as skipped.

use crate::engine::converter::ImageConverter;
use crate::error::BatchError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Lazy, finite sequence of source paths.
pub type PathStream = Box<dyn Iterator<Item = Result<PathBuf, BatchError>> + Send>;

/// Produces the sources for one job.
pub trait Discovery: Send + Sync {
    /// Fails up front when the root itself is unusable.
    fn discover(&self, root: &Path) -> Result<PathStream, BatchError>;
}

impl<F> Discovery for F
where
    F: Fn(&Path) -> Result<PathStream, BatchError> + Send + Sync,
{
    fn discover(&self, root: &Path) -> Result<PathStream, BatchError> {
        self(root)
    }
}

/// Recursive walk that keeps files whose extension is in the allow list.
#[derive(Clone, Debug)]
pub struct ExtensionScanner {
    extensions: Arc<[String]>,
    follow_links: bool,
}

impl ExtensionScanner {
    /// Extensions are matched case-insensitively; a leading dot is ignored.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions: Vec<String> = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self {
            extensions: extensions.into(),
            follow_links: false,
        }
    }

    pub fn follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn matches(&self, path: &Path) -> bool {
        matches_extension(&self.extensions, path)
    }
}

/// Picks up every extension ImageConverter can decode.
impl Default for ExtensionScanner {
    fn default() -> Self {
        Self::new(ImageConverter::decodable_extensions())
    }
}

fn matches_extension(extensions: &[String], path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Check that `root` exists and is a directory.
pub fn validate_root(root: &Path) -> Result<(), BatchError> {
    let display = || root.display().to_string();
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(BatchError::not_a_directory(display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(BatchError::root_not_found(display()))
        }
        Err(e) => Err(BatchError::discovery_failed(display(), e.to_string())),
    }
}

impl Discovery for ExtensionScanner {
    fn discover(&self, root: &Path) -> Result<PathStream, BatchError> {
        validate_root(root)?;
        let extensions = Arc::clone(&self.extensions);
        let walker = WalkDir::new(root)
            .follow_links(self.follow_links)
            .sort_by_file_name()
            .into_iter();

        let stream = walker.filter_map(move |entry| match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && matches_extension(&extensions, entry.path()) {
                    Some(Ok(entry.into_path()))
                } else {
                    None
                }
            }
            Err(err) => {
                let path = err
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                Some(Err(BatchError::discovery_failed(path, err.to_string())))
            }
        });
        Ok(Box::new(stream))
    }
}
