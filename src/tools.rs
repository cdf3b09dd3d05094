//! Host tool resolution.
//!
//! Resolution order for a tool `name` at an optional `version`:
//! 1. `<NAME>_BIN` env var (path to binary)
//! 2. Versioned binary in the user cache: `<cache>/distro-imager/bin/<name>-<version>`
//! 3. System PATH (`which <name>`)

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tracing::trace;

/// A host program plus the package that usually provides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tool {
    pub name: &'static str,
    pub package: &'static str,
}

pub const QEMU_IMG: Tool = Tool {
    name: "qemu-img",
    package: "qemu-utils",
};
pub const QEMU_SYSTEM: Tool = Tool {
    name: "qemu-system-x86_64",
    package: "qemu-system-x86",
};
pub const GENISOIMAGE: Tool = Tool {
    name: "genisoimage",
    package: "genisoimage",
};
pub const DOCKER: Tool = Tool {
    name: "docker",
    package: "docker.io",
};
pub const PACKER: Tool = Tool {
    name: "packer",
    package: "packer",
};
pub const AWS: Tool = Tool {
    name: "aws",
    package: "awscli",
};
pub const GSUTIL: Tool = Tool {
    name: "gsutil",
    package: "google-cloud-sdk",
};
pub const GCLOUD: Tool = Tool {
    name: "gcloud",
    package: "google-cloud-sdk",
};

/// `qemu-img` -> `QEMU_IMG_BIN`.
pub fn env_var_name(tool: &str) -> String {
    format!("{}_BIN", tool.to_ascii_uppercase().replace(['-', '.'], "_"))
}

/// Directory holding versioned tool binaries.
pub fn cache_bin_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("distro-imager").join("bin"))
}

/// Check if `path` is an executable regular file.
pub fn is_executable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => {
            if !meta.is_file() {
                return false;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if meta.permissions().mode() & 0o111 == 0 {
                    return false;
                }
            }
            true
        }
        Err(_) => false,
    }
}

/// Resolve `name` using the process environment and the user cache dir.
pub fn locate(name: &str, version: Option<&str>) -> Result<PathBuf> {
    locate_with(
        name,
        version,
        |key| env::var(key).ok(),
        cache_bin_dir().as_deref(),
    )
}

/// Resolution with injectable lookups, see the module docs for the order.
pub fn locate_with<F>(
    name: &str,
    version: Option<&str>,
    env_lookup: F,
    cache_dir: Option<&Path>,
) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let var = env_var_name(name);
    if let Some(bin_path) = env_lookup(&var) {
        let path = PathBuf::from(&bin_path);
        if !path.exists() {
            bail!("{} points to non-existent path: {}", var, bin_path);
        }
        if !is_executable(&path) {
            bail!(
                "{} points to invalid binary: {}\n\
                 File exists but is not executable.",
                var,
                bin_path
            );
        }
        trace!("{} resolved via {}", name, var);
        return Ok(path);
    }

    if let (Some(version), Some(dir)) = (version, cache_dir) {
        let cached = dir.join(format!("{name}-{version}"));
        if is_executable(&cached) {
            trace!("{} resolved from cache: {}", name, cached.display());
            return Ok(cached);
        }
    }

    match which::which(name) {
        Ok(path) => Ok(path),
        Err(_) => bail!(
            "{} not found. Set {}, install it on PATH{}",
            name,
            var,
            version
                .map(|v| format!(" or place {name}-{v} in the distro-imager cache"))
                .unwrap_or_default()
        ),
    }
}

/// Like [`locate`] but falls back to the bare name. Used when planning
/// commands that may never run (dry-run).
pub fn locate_or_bare(name: &str, version: Option<&str>) -> PathBuf {
    locate(name, version).unwrap_or_else(|_| PathBuf::from(name))
}
