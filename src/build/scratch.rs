use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, info};

/// Temporary working directory for one engine or converter call.
///
/// Removed on drop unless `keep` is set, in which case the path is logged so
/// the generated files can be inspected.
#[derive(Debug)]
pub struct ScratchDir {
    dir: Option<TempDir>,
    path: PathBuf,
    keep: bool,
}

impl ScratchDir {
    /// Create a fresh, uniquely named directory under `parent`.
    pub fn create_in(parent: &Path, prefix: &str, keep: bool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("distro-imager-{prefix}-"))
            .tempdir_in(parent)
            .with_context(|| format!("creating scratch directory in '{}'", parent.display()))?;
        let path = dir.path().to_path_buf();
        debug!("scratch directory: {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
            keep,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        if self.keep {
            let path = dir.keep();
            info!("keeping build artifacts in {}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let scratch = ScratchDir::create_in(tmp.path(), "packer", false).unwrap();
            fs::write(scratch.join("template.json"), "{}").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn kept_when_requested() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let scratch = ScratchDir::create_in(tmp.path(), "qemu", true).unwrap();
            scratch.path().to_path_buf()
        };
        assert!(path.is_dir());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("distro-imager-qemu-"));
    }

    #[test]
    fn never_reuses_an_existing_directory() {
        let tmp = TempDir::new().unwrap();
        let first = ScratchDir::create_in(tmp.path(), "x", false).unwrap();
        fs::write(first.join("foreign"), "keep me").unwrap();
        let second = ScratchDir::create_in(tmp.path(), "x", false).unwrap();
        assert_ne!(first.path(), second.path());
        assert!(!second.join("foreign").exists());
        drop(second);
        assert!(first.join("foreign").exists());
    }

    #[test]
    fn missing_parent_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = ScratchDir::create_in(&tmp.path().join("absent"), "x", false).unwrap_err();
        assert!(err.to_string().contains("creating scratch directory"));
    }
}
