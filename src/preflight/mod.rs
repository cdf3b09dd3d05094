//! Preflight checks for build validation.
//!
//! Validates that the host has the tools the selected engine and the
//! requested conversions need, before anything external happens. Checks only
//! look at the filesystem and `PATH`; no process is spawned.
//!
//! # Example
//!
//! ```rust
//! use distro_imager::preflight::{check_required_tools, command_exists};
//! use distro_imager::tools::PACKER;
//!
//! if !command_exists("packer") {
//!     eprintln!("packer not installed");
//! }
//! if let Err(e) = check_required_tools(&[(PACKER, None)]) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::tools::{self, Tool};

/// Check if a command resolves on this host.
pub fn command_exists(cmd: &str) -> bool {
    tools::locate(cmd, None).is_ok()
}

/// Check that every tool resolves (at its version, if given).
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with the list of missing tools and their packages
pub fn check_required_tools(required: &[(Tool, Option<&str>)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, version) in required {
        if tools::locate(tool.name, *version).is_err() {
            missing.push(*tool);
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|t| {
                format!(
                    "  {} (install: {}, or set {})",
                    t.name,
                    t.package,
                    tools::env_var_name(t.name)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_command_exists() {
        // 'sh' should exist on any Unix system
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure() {
        let fake = Tool {
            name: "nonexistent_command_xyz",
            package: "fake-package",
        };
        let err = check_required_tools(&[(fake, None)]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nonexistent_command_xyz (install: fake-package"));
        assert!(msg.contains("NONEXISTENT_COMMAND_XYZ_BIN"));
    }

    #[test]
    fn test_check_required_tools_empty() {
        assert!(check_required_tools(&[]).is_ok());
    }
}
