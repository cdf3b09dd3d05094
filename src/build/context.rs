//! Aggregate state for one build run.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde_json::{Map, Value};

use crate::build::{CancelToken, ScratchDir};
use crate::config::BuildConfig;
use crate::distro::{Distribution, OsFamily};
use crate::engine::{EngineDefaults, EngineKind};
use crate::image::Image;
use crate::process::{run_checked, CommandOutput, CommandRunner, CommandSpec};
use crate::tools::{self, Tool};

/// Everything an engine or converter needs, resolved up front.
///
/// Built by the orchestrator once the input image has been merged with its
/// distro template. Lives for exactly one run.
pub struct BuildContext<'a> {
    /// Schema-less mirror of `config`.
    pub raw: Value,
    pub config: BuildConfig,
    pub input: Image,
    pub outputs: Vec<Image>,
    pub engine: EngineKind,
    pub distro_name: String,
    pub distro: Distribution,
    /// Resolved once from `distro.os`.
    pub family: OsFamily,
    pub defaults: EngineDefaults,
    pub dry_run: bool,
    /// Leave scratch directories behind for inspection.
    pub keep_artifacts: bool,
    pub cancel: CancelToken,
    pub runner: &'a dyn CommandRunner,
}

impl BuildContext<'_> {
    pub fn output_dir(&self) -> PathBuf {
        self.config.output_dir()
    }

    /// The `engine` mapping of the raw config.
    pub fn raw_engine(&self) -> Option<&Map<String, Value>> {
        self.raw.get("engine").and_then(Value::as_object)
    }

    /// Guest provisioning script for the distro's OS family.
    pub fn provisioning_script(&self) -> String {
        self.config
            .provisioning
            .render_script(&self.family.hooks())
    }

    pub fn scratch(&self, prefix: &str) -> Result<ScratchDir> {
        self.scratch_in(&std::env::temp_dir(), prefix)
    }

    /// Scratch directory under `parent`, e.g. next to an output that is
    /// moved into place once it is complete.
    pub fn scratch_in(&self, parent: &Path, prefix: &str) -> Result<ScratchDir> {
        if self.dry_run {
            bail!("refusing to create a scratch directory during a dry run");
        }
        ScratchDir::create_in(parent, prefix, self.keep_artifacts)
    }

    /// Path to a host tool. Presence is enforced by preflight before the
    /// engine runs, so an unresolved tool is planned by its bare name.
    pub fn tool(&self, tool: Tool, version: Option<&str>) -> PathBuf {
        tools::locate_or_bare(tool.name, version)
    }

    /// Engine option `key`: the user's `engine.*` value, else the default
    /// table for the selected engine.
    pub fn engine_option(&self, key: &str) -> Option<&Value> {
        self.option_for(self.engine, key)
    }

    /// Like [`engine_option`](Self::engine_option), but falls back to the
    /// defaults of `engine` rather than the selected one.
    pub fn option_for(&self, engine: EngineKind, key: &str) -> Option<&Value> {
        self.config
            .engine
            .options
            .get(key)
            .or_else(|| self.defaults.get(engine.as_str(), key))
    }

    /// Run a command to completion, failing on non-zero exit.
    pub fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        if self.dry_run {
            bail!("refusing to run '{}' during a dry run", spec);
        }
        if self.cancel.is_cancelled() {
            bail!("build cancelled before running {}", spec.program_name());
        }
        run_checked(self.runner, spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{context, qemu_input};
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    #[test]
    fn script_follows_the_resolved_family() {
        let runner = RecordingRunner::new();
        let mut ctx = context(&runner, EngineKind::Qemu, qemu_input("/a"), true);
        ctx.config.provisioning.packages = vec!["curl".into()];
        assert!(ctx.provisioning_script().contains("apt-get install"));

        ctx.family = OsFamily::RedHat;
        let script = ctx.provisioning_script();
        assert!(script.contains("yum install -y curl"));
        assert!(!script.contains("apt-get"));
    }

    #[test]
    fn option_for_reads_the_named_engine_defaults() {
        let runner = RecordingRunner::new();
        let mut ctx = context(&runner, EngineKind::Noop, qemu_input("/a"), true);
        assert_eq!(ctx.engine_option("cpus"), None);
        assert_eq!(ctx.option_for(EngineKind::Qemu, "cpus"), Some(&Value::from(2)));

        ctx.config.engine.options.insert("cpus".into(), Value::from(6));
        assert_eq!(ctx.option_for(EngineKind::Qemu, "cpus"), Some(&Value::from(6)));
    }

    #[test]
    fn scratch_refused_in_dry_run() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let ctx = context(&runner, EngineKind::Qemu, qemu_input("/a"), true);
        assert!(ctx.scratch_in(tmp.path(), "qemu").is_err());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
