//! Local qemu engine.
//!
//! Creates a qcow2 overlay on top of the input disk, boots it once with a
//! cloud-init seed that runs the provisioning script and powers off, then
//! hands back the overlay as the realized image.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::{engine_err, Engine, EngineKind};
use crate::build::{now_utc_compact, BuildContext};
use crate::error::{BuildError, Result};
use crate::image::{DiskImage, Image};
use crate::process::CommandSpec;
use crate::tools::{Tool, GENISOIMAGE, QEMU_IMG, QEMU_SYSTEM};

/// Written to the serial console by the guest after provisioning.
pub const SUCCESS_MARKER: &str = "___DISTRO_IMAGER_PROVISIONED___";
/// Written instead of [`SUCCESS_MARKER`] when the script fails.
pub const FAILURE_MARKER: &str = "___DISTRO_IMAGER_FAILED___";

const GUEST_SCRIPT: &str = "/var/lib/distro-imager/provision.sh";

/// Builder for the qemu-system command that runs the provisioning boot.
#[derive(Debug, Default)]
pub struct QemuBuilder {
    disk: Option<PathBuf>,
    seed: Option<PathBuf>,
    serial_log: Option<PathBuf>,
    cpus: u32,
    memory_mb: u32,
    accelerator: String,
    headless: bool,
}

impl QemuBuilder {
    pub fn new(cpus: u32, memory_mb: u32) -> Self {
        Self {
            cpus,
            memory_mb,
            accelerator: "tcg".to_string(),
            headless: true,
            ..Default::default()
        }
    }

    pub fn disk(mut self, path: PathBuf) -> Self {
        self.disk = Some(path);
        self
    }

    pub fn seed(mut self, path: PathBuf) -> Self {
        self.seed = Some(path);
        self
    }

    pub fn serial_log(mut self, path: PathBuf) -> Self {
        self.serial_log = Some(path);
        self
    }

    pub fn accelerator(mut self, accel: &str) -> Self {
        self.accelerator = accel.to_string();
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn build(self, program: PathBuf) -> CommandSpec {
        let mut cmd = CommandSpec::new(program);

        cmd = cmd.args(["-machine", &format!("accel={}", self.accelerator)]);
        if self.accelerator == "kvm" {
            cmd = cmd.args(["-cpu", "host"]);
        }
        cmd = cmd
            .args(["-smp", &self.cpus.to_string()])
            .args(["-m", &format!("{}M", self.memory_mb)]);

        if let Some(disk) = &self.disk {
            cmd = cmd.args([
                "-drive",
                &format!("file={},format=qcow2,if=virtio", disk.display()),
            ]);
        }

        // cloud-init NoCloud seed
        if let Some(seed) = &self.seed {
            cmd = cmd.args([
                "-drive",
                &format!("file={},format=raw,if=virtio,readonly=on", seed.display()),
            ]);
        }

        // Network: virtio-net with user-mode NAT
        cmd = cmd.args([
            "-netdev",
            "user,id=net0",
            "-device",
            "virtio-net-pci,netdev=net0",
        ]);

        if let Some(log) = &self.serial_log {
            cmd = cmd.args(["-serial", &format!("file:{}", log.display())]);
        }

        if self.headless {
            cmd = cmd.args(["-display", "none"]);
        }
        cmd.arg("-no-reboot")
    }
}

#[derive(Serialize)]
struct WriteFile<'a> {
    path: &'a str,
    permissions: &'a str,
    content: String,
}

#[derive(Serialize)]
struct PowerState<'a> {
    mode: &'a str,
    condition: bool,
}

#[derive(Serialize)]
struct CloudConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<&'a str>,
    write_files: Vec<WriteFile<'a>>,
    runcmd: Vec<String>,
    power_state: PowerState<'a>,
}

/// Render cloud-init `user-data` that runs `script` once and powers off.
pub fn user_data(script: String, hostname: Option<&str>) -> anyhow::Result<String> {
    let config = CloudConfig {
        hostname,
        write_files: vec![WriteFile {
            path: GUEST_SCRIPT,
            permissions: "0755",
            content: script,
        }],
        runcmd: vec![format!(
            "{GUEST_SCRIPT} && echo {SUCCESS_MARKER} > /dev/ttyS0 || echo {FAILURE_MARKER} > /dev/ttyS0"
        )],
        power_state: PowerState {
            mode: "poweroff",
            condition: true,
        },
    };
    let body = serde_yaml::to_string(&config).context("rendering cloud-init user-data")?;
    Ok(format!("#cloud-config\n{body}"))
}

/// Settings resolved from typed config, `engine.*` options and the qemu
/// defaults. Anything describing the provisioned VM reads these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QemuSettings {
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_size_mb: u64,
    pub headless: bool,
    pub accelerator: String,
}

impl QemuSettings {
    pub fn resolve(ctx: &BuildContext<'_>) -> Self {
        let engine = &ctx.config.engine;
        let option = |key: &str| ctx.option_for(EngineKind::Qemu, key);
        let option_u32 = |key: &str| {
            option(key)
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
        };
        Self {
            cpus: engine.cpus.or_else(|| option_u32("cpus")).unwrap_or(2),
            memory_mb: engine
                .memory_mb
                .or_else(|| option_u32("memory_mb"))
                .unwrap_or(2048),
            disk_size_mb: engine
                .disk_size_mb
                .or_else(|| option("disk_size_mb").and_then(Value::as_u64))
                .unwrap_or(10240),
            headless: engine
                .headless
                .or_else(|| option("headless").and_then(Value::as_bool))
                .unwrap_or(true),
            accelerator: option("accelerator")
                .and_then(Value::as_str)
                .unwrap_or("kvm")
                .to_string(),
        }
    }
}

/// The last `lines` lines of the guest's serial output.
fn serial_tail(serial: &str, lines: usize) -> String {
    let tail: Vec<&str> = serial.lines().rev().take(lines).collect();
    tail.into_iter().rev().collect::<Vec<_>>().join("\n")
}

/// Builds qcow2 images by booting the input disk under qemu.
#[derive(Debug, Default, Clone, Copy)]
pub struct QemuEngine;

impl QemuEngine {
    fn source(ctx: &BuildContext<'_>) -> Result<DiskImage> {
        match &ctx.input {
            Image::Qemu(disk) => {
                ctx.input.require_complete()?;
                Ok(disk.clone())
            }
            other => Err(BuildError::invalid_config(format!(
                "qemu engine needs a qemu input image, got {}",
                other.kind()
            ))),
        }
    }

    fn output_path(ctx: &BuildContext<'_>) -> PathBuf {
        ctx.output_dir()
            .join(format!("{}-{}.qcow2", ctx.distro_name, now_utc_compact()))
    }

    /// Provision into an overlay inside a scratch directory next to `output`
    /// and move it into place only once the guest reports success. Nothing is
    /// left at `output` on failure.
    fn build(
        &self,
        ctx: &BuildContext<'_>,
        source: &DiskImage,
        output: &Path,
        settings: &QemuSettings,
    ) -> anyhow::Result<()> {
        let source_path = source.path.as_deref().unwrap_or_default();
        let source_format = source.format.as_deref().unwrap_or("qcow2");
        // The overlay moves after creation, so its backing path must not be relative.
        let backing = std::path::absolute(source_path)
            .with_context(|| format!("resolving backing image '{source_path}'"))?;

        let output_dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(output_dir)
            .with_context(|| format!("creating output directory '{}'", output_dir.display()))?;
        let scratch = ctx.scratch_in(output_dir, "qemu")?;

        let overlay = scratch.join("disk.qcow2");
        ctx.run(
            &CommandSpec::new(ctx.tool(QEMU_IMG, None))
                .args(["create", "-f", "qcow2", "-F", source_format, "-b"])
                .path_arg(&backing)
                .path_arg(&overlay)
                .arg(format!("{}M", settings.disk_size_mb)),
        )?;

        let seed_dir = scratch.join("seed");
        fs::create_dir_all(&seed_dir)
            .with_context(|| format!("creating seed directory '{}'", seed_dir.display()))?;

        let hostname = ctx.config.provisioning.hostname.as_deref();
        fs::write(
            seed_dir.join("user-data"),
            user_data(ctx.provisioning_script(), hostname)?,
        )
        .context("writing user-data")?;
        fs::write(
            seed_dir.join("meta-data"),
            format!(
                "instance-id: {}\nlocal-hostname: {}\n",
                output
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                hostname.unwrap_or(&ctx.distro_name)
            ),
        )
        .context("writing meta-data")?;

        let seed_iso = scratch.join("seed.iso");
        ctx.run(
            &CommandSpec::new(ctx.tool(GENISOIMAGE, None))
                .arg("-output")
                .path_arg(&seed_iso)
                .args(["-volid", "cidata", "-joliet", "-rock", "user-data", "meta-data"])
                .current_dir(&seed_dir),
        )?;

        let serial_log = scratch.join("serial.log");
        let accelerator = if settings.accelerator == "kvm" && !Path::new("/dev/kvm").exists() {
            "tcg"
        } else {
            settings.accelerator.as_str()
        };
        let boot = QemuBuilder::new(settings.cpus, settings.memory_mb)
            .disk(overlay.clone())
            .seed(seed_iso)
            .serial_log(serial_log.clone())
            .accelerator(accelerator)
            .headless(settings.headless)
            .build(ctx.tool(QEMU_SYSTEM, None));
        info!("booting {} to provision it", output.display());
        ctx.run(&boot)?;

        let serial = fs::read_to_string(&serial_log).unwrap_or_default();
        if serial.contains(FAILURE_MARKER) {
            bail!(
                "provisioning script failed inside the guest\n\nLast output:\n{}",
                serial_tail(&serial, 20)
            );
        }
        if !serial.contains(SUCCESS_MARKER) {
            bail!(
                "guest powered off without reporting provisioning status\n\nLast output:\n{}",
                serial_tail(&serial, 20)
            );
        }

        fs::rename(&overlay, output)
            .with_context(|| format!("moving {} to {}", overlay.display(), output.display()))?;
        Ok(())
    }
}

impl Engine for QemuEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Qemu
    }

    fn required_tools(&self, _ctx: &BuildContext<'_>) -> Vec<(Tool, Option<String>)> {
        vec![(QEMU_IMG, None), (GENISOIMAGE, None), (QEMU_SYSTEM, None)]
    }

    fn configure(&self, ctx: &BuildContext<'_>) -> Result<Image> {
        let source = Self::source(ctx)?;
        let settings = QemuSettings::resolve(ctx);
        let output = Self::output_path(ctx);
        info!(
            "qemu: {} -> {} ({} cpus, {} MB)",
            source.path.as_deref().unwrap_or_default(),
            output.display(),
            settings.cpus,
            settings.memory_mb
        );

        if ctx.dry_run {
            info!("dry run: skipping qemu build");
        } else {
            self.build(ctx, &source, &output, &settings)
                .map_err(engine_err(EngineKind::Qemu, "configure"))?;
        }

        Ok(Image::Qemu(DiskImage {
            path: Some(output.display().to_string()),
            format: Some("qcow2".to_string()),
            checksum: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{context, qemu_input};
    use crate::process::testing::RecordingRunner;
    use crate::process::CommandOutput;
    use tempfile::TempDir;

    fn serial_path(spec: &CommandSpec) -> PathBuf {
        let idx = spec.args.iter().position(|a| a == "-serial").unwrap();
        PathBuf::from(spec.args[idx + 1].strip_prefix("file:").unwrap())
    }

    #[test]
    fn builder_args() {
        let spec = QemuBuilder::new(4, 4096)
            .disk(PathBuf::from("/out/disk.qcow2"))
            .serial_log(PathBuf::from("/tmp/serial.log"))
            .accelerator("kvm")
            .build(PathBuf::from("qemu-system-x86_64"));
        let line = spec.to_string();
        assert!(line.contains("-machine accel=kvm -cpu host -smp 4 -m 4096M"));
        assert!(line.contains("file=/out/disk.qcow2,format=qcow2,if=virtio"));
        assert!(line.contains("-serial file:/tmp/serial.log"));
        assert!(line.ends_with("-display none -no-reboot"));
    }

    #[test]
    fn user_data_runs_script_and_powers_off() {
        let text = user_data("#!/bin/sh\necho hi\n".into(), Some("box")).unwrap();
        assert!(text.starts_with("#cloud-config\n"));
        let parsed: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(parsed["hostname"].as_str(), Some("box"));
        assert_eq!(parsed["write_files"][0]["path"].as_str(), Some(GUEST_SCRIPT));
        assert_eq!(
            parsed["write_files"][0]["content"].as_str(),
            Some("#!/bin/sh\necho hi\n")
        );
        assert_eq!(parsed["power_state"]["mode"].as_str(), Some("poweroff"));
    }

    #[test]
    fn dry_run_plans_output_only() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let mut ctx = context(&runner, EngineKind::Qemu, qemu_input("/srv/base.qcow2"), true);
        ctx.config.output_dir = Some(tmp.path().join("out").display().to_string());

        let image = QemuEngine.configure(&ctx).unwrap();
        assert!(runner.calls().is_empty());
        assert!(!tmp.path().join("out").exists());
        let path = image.to_string();
        assert!(path.contains("/out/ubuntu1804-"));
        assert!(path.ends_with(".qcow2"));
    }

    /// Runner whose qemu-img writes the overlay and whose guest prints `serial`.
    fn fake_qemu(serial: &'static str) -> RecordingRunner {
        RecordingRunner::new()
            .respond("qemu-img", |spec| {
                fs::write(&spec.args[spec.args.len() - 2], b"overlay").unwrap();
                CommandOutput::ok("")
            })
            .respond("qemu-system-x86_64", move |spec| {
                fs::write(serial_path(spec), serial).unwrap();
                CommandOutput::ok("")
            })
    }

    #[test]
    fn build_runs_overlay_seed_and_boot() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_qemu("boot\n___DISTRO_IMAGER_PROVISIONED___\n");
        let mut ctx = context(&runner, EngineKind::Qemu, qemu_input("/srv/base.img"), false);
        ctx.config.output_dir = Some(tmp.path().display().to_string());
        ctx.config.engine.cpus = Some(8);

        let image = QemuEngine.configure(&ctx).unwrap();
        assert_eq!(
            runner.programs(),
            ["qemu-img", "genisoimage", "qemu-system-x86_64"]
        );
        let calls = runner.calls();
        assert!(calls[0].args.contains(&"/srv/base.img".to_string()));
        assert!(calls[2].args.windows(2).any(|w| w == ["-smp", "8"]));

        let path = image.to_string();
        assert!(path.starts_with(&tmp.path().display().to_string()));
        assert_eq!(fs::read(&path).unwrap(), b"overlay");
        let entries: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "scratch directory left behind");
    }

    #[test]
    fn missing_marker_fails_the_build() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_qemu("E: unable to locate package\n___DISTRO_IMAGER_FAILED___\n");
        let mut ctx = context(&runner, EngineKind::Qemu, qemu_input("/srv/base.img"), false);
        ctx.config.output_dir = Some(tmp.path().display().to_string());

        let err = QemuEngine.configure(&ctx).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Engine);
        let msg = format!("{:#}", anyhow::Error::from(err));
        assert!(msg.contains("provisioning script failed"));
        assert!(msg.contains("unable to locate package"));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn silent_guest_leaves_no_output() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_qemu("kernel panic\n");
        let mut ctx = context(&runner, EngineKind::Qemu, qemu_input("/srv/base.img"), false);
        ctx.config.output_dir = Some(tmp.path().display().to_string());

        let err = QemuEngine.configure(&ctx).unwrap_err();
        let msg = format!("{:#}", anyhow::Error::from(err));
        assert!(msg.contains("without reporting provisioning status"));
        assert!(msg.contains("kernel panic"));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn serial_tail_keeps_last_lines() {
        assert_eq!(serial_tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(serial_tail("", 5), "");
    }

    #[test]
    fn rejects_non_disk_input() {
        let runner = RecordingRunner::new();
        let ctx = context(
            &runner,
            EngineKind::Qemu,
            Image::empty(crate::image::ImageKind::Docker),
            true,
        );
        assert!(QemuEngine.configure(&ctx).is_err());
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        let runner = RecordingRunner::new();
        let ctx = context(&runner, EngineKind::Qemu, qemu_input("/a"), true);
        let settings = QemuSettings::resolve(&ctx);
        assert_eq!(settings.cpus, 2);
        assert_eq!(settings.memory_mb, 2048);
        assert_eq!(settings.disk_size_mb, 10240);
        assert_eq!(settings.accelerator, "kvm");
    }
}
