//! Provisioning spec and the supported-OS table.
//!
//! The spec describes what to do inside the guest. Every engine turns it
//! into the same POSIX shell script via [`ProvisioningSpec::render_script`],
//! using the package-manager hooks of the distro's OS family.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::distro::FamilyHooks;
use crate::error::{BuildError, Result};
use crate::image::is_unset;

/// What to install and run inside the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSpec {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    /// Guest path -> file content.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub hostname: Option<String>,
    /// Capability tags, filled from the supported-OS table.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// One OS the provisioning layer knows how to handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedOs {
    pub id: &'static str,
    pub tags: &'static [&'static str],
}

const SUPPORTED_OS: &[SupportedOs] = &[
    SupportedOs {
        id: "ubuntu",
        tags: &["apt", "systemd", "cloud-init"],
    },
    SupportedOs {
        id: "debian",
        tags: &["apt", "systemd", "cloud-init"],
    },
    SupportedOs {
        id: "centos",
        tags: &["yum", "systemd", "selinux", "cloud-init"],
    },
    SupportedOs {
        id: "redhat",
        tags: &["yum", "systemd", "selinux", "cloud-init"],
    },
    SupportedOs {
        id: "fedora",
        tags: &["dnf", "systemd", "selinux", "cloud-init"],
    },
    SupportedOs {
        id: "amazonLinux",
        tags: &["yum", "systemd", "cloud-init"],
    },
];

/// Table of OS identifiers accepted for provisioning.
#[derive(Debug, Clone)]
pub struct ProvisioningTable {
    entries: Vec<SupportedOs>,
}

impl Default for ProvisioningTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProvisioningTable {
    pub fn builtin() -> Self {
        Self {
            entries: SUPPORTED_OS.to_vec(),
        }
    }

    /// Supported identifiers, sorted.
    pub fn supported(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.id.to_string()).collect();
        ids.sort();
        ids
    }

    pub fn lookup(&self, os: &str) -> Result<&SupportedOs> {
        self.entries
            .iter()
            .find(|e| e.id == os)
            .ok_or_else(|| BuildError::UnsupportedOs {
                os: os.to_string(),
                supported: self.supported(),
            })
    }
}

impl ProvisioningSpec {
    /// Add `tags` not already present, keeping existing order.
    pub fn inject_tags(&mut self, tags: &[&str]) {
        for tag in tags {
            if !self.tags.iter().any(|t| t == tag) {
                self.tags.push((*tag).to_string());
            }
        }
        debug!("provisioning tags: {:?}", self.tags);
    }

    /// Render the guest-side script for a family's package manager.
    pub fn render_script(&self, hooks: &FamilyHooks) -> String {
        let mut script = String::from("#!/bin/sh\nset -eu\n");

        if !self.tags.is_empty() {
            let _ = writeln!(script, "# tags: {}", self.tags.join(" "));
        }
        for (key, value) in &self.environment {
            let _ = writeln!(script, "export {}={}", key, shell_quote(value));
        }
        if let Some(hostname) = self.hostname.as_deref().filter(|h| !h.is_empty()) {
            let quoted = shell_quote(hostname);
            let _ = writeln!(script, "echo {quoted} > /etc/hostname");
            let _ = writeln!(script, "hostname {quoted} || true");
        }

        if !self.packages.is_empty() {
            for line in hooks.pre_install {
                script.push_str(line);
                script.push('\n');
            }
            let packages: Vec<String> = self.packages.iter().map(|p| shell_quote(p)).collect();
            let _ = writeln!(script, "{} {}", hooks.install, packages.join(" "));
        }

        for (path, content) in &self.files {
            let quoted = shell_quote(path);
            let delimiter = heredoc_delimiter(content);
            let _ = writeln!(script, "mkdir -p \"$(dirname {quoted})\"");
            let _ = writeln!(script, "cat > {quoted} <<'{delimiter}'");
            script.push_str(content);
            if !content.ends_with('\n') {
                script.push('\n');
            }
            script.push_str(&delimiter);
            script.push('\n');
        }

        for command in &self.commands {
            script.push_str(command);
            script.push('\n');
        }

        if !self.packages.is_empty() {
            for line in hooks.cleanup {
                script.push_str(line);
                script.push('\n');
            }
        }
        script
    }
}

const HEREDOC: &str = "DISTRO_IMAGER_EOF";

/// A heredoc terminator that no line of `content` equals.
fn heredoc_delimiter(content: &str) -> String {
    let mut delimiter = HEREDOC.to_string();
    let mut n = 0;
    while content.lines().any(|line| line == delimiter) {
        n += 1;
        delimiter = format!("{HEREDOC}_{n}");
    }
    delimiter
}

/// Single-quote `value` for a POSIX shell.
pub(crate) fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::OsFamily;

    #[test]
    fn lookup_lists_supported_os_on_failure() {
        let table = ProvisioningTable::builtin();
        assert!(table.lookup("amazonLinux").is_ok());
        let err = table.lookup("plan9").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("plan9"));
        assert!(msg.contains("amazonLinux, centos, debian, fedora, redhat, ubuntu"));
    }

    #[test]
    fn inject_tags_deduplicates() {
        let mut spec = ProvisioningSpec {
            tags: vec!["systemd".into(), "custom".into()],
            ..Default::default()
        };
        spec.inject_tags(&["apt", "systemd"]);
        assert_eq!(spec.tags, ["systemd", "custom", "apt"]);
    }

    #[test]
    fn script_uses_family_package_manager() {
        let spec = ProvisioningSpec {
            packages: vec!["curl".into(), "jq".into()],
            commands: vec!["systemctl enable docker".into()],
            ..Default::default()
        };
        let apt = spec.render_script(&OsFamily::Ubuntu.hooks());
        assert!(apt.starts_with("#!/bin/sh\nset -eu\n"));
        assert!(apt.contains("apt-get install -y -q curl jq"));
        assert!(apt.contains("systemctl enable docker\n"));

        let yum = spec.render_script(&OsFamily::RedHat.hooks());
        assert!(yum.contains("yum install -y curl jq"));
        assert!(!yum.contains("apt-get"));
    }

    #[test]
    fn script_quotes_environment_and_writes_files() {
        let mut spec = ProvisioningSpec::default();
        spec.environment.insert("GREETING".into(), "it's here".into());
        spec.files.insert("/etc/motd".into(), "welcome".into());
        spec.hostname = Some("builder".into());
        let script = spec.render_script(&OsFamily::Debian.hooks());
        assert!(script.contains(r"export GREETING='it'\''s here'"));
        assert!(script.contains(
            "cat > /etc/motd <<'DISTRO_IMAGER_EOF'\nwelcome\nDISTRO_IMAGER_EOF\n"
        ));
        assert!(script.contains("echo builder > /etc/hostname"));
        assert!(!script.contains("install"));
    }

    #[test]
    fn file_containing_the_delimiter_is_written_intact() {
        let content = "before\nDISTRO_IMAGER_EOF\nDISTRO_IMAGER_EOF_1\nafter\n";
        let mut spec = ProvisioningSpec::default();
        spec.files.insert("/opt/notes".into(), content.into());
        let script = spec.render_script(&OsFamily::Ubuntu.hooks());
        assert!(script.contains(&format!(
            "cat > /opt/notes <<'DISTRO_IMAGER_EOF_2'\n{content}DISTRO_IMAGER_EOF_2\n"
        )));
    }
}
