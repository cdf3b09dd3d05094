//! Read-only asset namespace: distro profiles and engine defaults.
//!
//! Layout (identical for both sources):
//!
//! ```text
//! defaults.toml          engine name -> option table
//! distros/<file>.toml    distro name -> profile
//! ```
//!
//! The embedded source is compiled into the binary. `--assets DIR` swaps in
//! [`DirAssets`] over a directory with the same layout.

use std::fs;
use std::path::PathBuf;

use walkdir::WalkDir;

use crate::error::{BuildError, Result};

/// Directory holding distro profiles.
pub const DISTROS_DIR: &str = "distros";

/// Engine defaults table.
pub const DEFAULTS_FILE: &str = "defaults.toml";

/// Listing plus byte-read access over a fixed namespace.
pub trait AssetSource: Send + Sync {
    /// Names of the files directly under `dir`, sorted.
    fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Contents of `path` (relative to the namespace root).
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|e| BuildError::Asset {
            path: path.to_string(),
            reason: format!("not valid UTF-8: {e}"),
        })
    }
}

const EMBEDDED: &[(&str, &str)] = &[
    (DEFAULTS_FILE, include_str!("../../assets/defaults.toml")),
    (
        "distros/amazonLinux.toml",
        include_str!("../../assets/distros/amazonLinux.toml"),
    ),
    (
        "distros/debian.toml",
        include_str!("../../assets/distros/debian.toml"),
    ),
    (
        "distros/redhat.toml",
        include_str!("../../assets/distros/redhat.toml"),
    ),
    (
        "distros/ubuntu.toml",
        include_str!("../../assets/distros/ubuntu.toml"),
    ),
];

/// Assets compiled into the binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedAssets;

impl AssetSource for EmbeddedAssets {
    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut names: Vec<String> = EMBEDDED
            .iter()
            .filter_map(|(path, _)| path.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(BuildError::Asset {
                path: dir.to_string(),
                reason: "no such embedded directory".to_string(),
            });
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        EMBEDDED
            .iter()
            .find(|(name, _)| *name == path)
            .map(|(_, text)| text.as_bytes().to_vec())
            .ok_or_else(|| BuildError::Asset {
                path: path.to_string(),
                reason: "no such embedded asset".to_string(),
            })
    }
}

/// Assets read from a directory on disk.
#[derive(Debug, Clone)]
pub struct DirAssets {
    root: PathBuf,
}

impl DirAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetSource for DirAssets {
    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let base = self.root.join(dir);
        let asset_err = |reason: String| BuildError::Asset {
            path: base.display().to_string(),
            reason,
        };
        if !base.is_dir() {
            return Err(asset_err("directory does not exist".to_string()));
        }

        let mut names = Vec::new();
        for entry in WalkDir::new(&base).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| asset_err(e.to_string()))?;
            if entry.file_type().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.root.join(path);
        fs::read(&full).map_err(|e| BuildError::Asset {
            path: full.display().to_string(),
            reason: e.to_string(),
        })
    }
}
