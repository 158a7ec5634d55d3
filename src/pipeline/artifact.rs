//! Scratch space for the files a run downloads or produces.

use anyhow::Context as _;
use tempfile::TempDir;

use std::path::{Path, PathBuf};

/// A private directory under the scratch root, removed when the run ends.
///
/// Dropping the guard removes the directory even on early return or panic;
/// [`RunScratch::cleanup`] does the same and logs removal failures.
pub struct RunScratch {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl RunScratch {
    pub fn create(root: &Path, run_id: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create scratch root: {}", root.display()))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("run-{run_id}-"))
            .tempdir_in(root)
            .with_context(|| format!("failed to create run directory in {}", root.display()))?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn cleanup(mut self) {
        if let Some(dir) = self.dir.take()
            && let Err(error) = dir.close()
        {
            tracing::warn!(path = %self.path.display(), %error, "failed to remove run scratch directory");
        }
    }
}
