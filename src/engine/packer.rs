//! Packer engine.
//!
//! Generates a packer template from the raw config's `engine.builders`
//! mapping, runs `packer build`, and reads the realized image back from the
//! manifest post-processor's output.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{engine_err, Engine, EngineKind};
use crate::build::{now_utc_compact, BuildContext};
use crate::error::{BuildError, Result};
use crate::image::{AmiImage, DiskImage, GceImage, Image};
use crate::manifest::Manifest;
use crate::process::CommandSpec;
use crate::tools::{Tool, PACKER};

pub const DEFAULT_PACKER_VERSION: &str = "1.5.5";

const TEMPLATE_FILE: &str = "packer-template.json";
const MANIFEST_FILE: &str = "packer-manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackerTemplate {
    pub builders: Vec<Map<String, Value>>,
    pub provisioners: Vec<Value>,
    #[serde(rename = "post-processors")]
    pub post_processors: Vec<Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
}

impl PackerTemplate {
    /// Build the template for `ctx`, with the manifest written to `manifest`.
    ///
    /// Each builder layers its options as: defaults table, then the input
    /// image's source options, then the user's options for that builder.
    pub fn generate(ctx: &BuildContext<'_>, manifest: &Path) -> Result<Self> {
        let builders = ctx
            .raw_engine()
            .and_then(|engine| engine.get("builders"))
            .and_then(Value::as_object)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                BuildError::invalid_config(
                    "packer engine: must specify at least 1 builder in engine.builders",
                )
            })?;

        let source_options = ctx.input.builder_options();
        let stamp = now_utc_compact();
        let mut rendered = Vec::with_capacity(builders.len());
        for (name, user) in builders {
            let mut builder = Map::new();
            builder.insert("type".to_string(), Value::from(name.as_str()));
            if let Some(defaults) = ctx.defaults.nested("packer", &["builders", name]) {
                builder.extend(defaults.clone());
            }
            builder.extend(source_options.clone());
            match user {
                Value::Object(user) => builder.extend(user.clone()),
                Value::Null => {}
                other => {
                    return Err(BuildError::invalid_config(format!(
                        "packer builder '{name}' must be a mapping, found {other}"
                    )))
                }
            }
            if builder.get("type").and_then(Value::as_str) == Some("qemu")
                && !builder.contains_key("output_directory")
            {
                let dir = ctx.output_dir().join(format!("packer-{name}-{stamp}"));
                builder.insert(
                    "output_directory".to_string(),
                    Value::from(dir.display().to_string()),
                );
            }
            rendered.push(builder);
        }

        let script = ctx.provisioning_script();
        let inline: Vec<&str> = script.lines().filter(|l| !l.starts_with("#!")).collect();

        Ok(Self {
            builders: rendered,
            provisioners: vec![json!({
                "type": "shell",
                "execute_command": "sudo sh -c '{{ .Vars }} {{ .Path }}'",
                "inline": inline,
            })],
            post_processors: vec![json!({
                "type": "manifest",
                "output": manifest.display().to_string(),
                "strip_path": false,
            })],
            variables: ctx.config.variables.clone().into_iter().collect(),
        })
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("serializing packer template")
    }

    /// The image the first builder would produce, without running anything.
    fn planned_image(&self, input: &Image) -> Image {
        let Some(builder) = self.builders.first() else {
            return input.clone();
        };
        let text = |key: &str| builder.get(key).and_then(Value::as_str).map(str::to_string);
        match builder.get("type").and_then(Value::as_str) {
            Some("amazon-ebs") => Image::Ami(AmiImage {
                region: text("region"),
                id: Some("ami-dry-run".to_string()),
            }),
            Some("qemu") => {
                let format = text("format").unwrap_or_else(|| "qcow2".to_string());
                let dir = text("output_directory").unwrap_or_else(|| "output-qemu".to_string());
                let name = text("vm_name").unwrap_or_else(|| "packer-qemu".to_string());
                Image::Qemu(DiskImage {
                    path: Some(PathBuf::from(dir).join(name).display().to_string()),
                    format: Some(format),
                    checksum: None,
                })
            }
            Some("googlecompute") => Image::Gce(GceImage {
                project: text("project_id"),
                image: text("image_name").or_else(|| Some("dry-run".to_string())),
                bucket: None,
            }),
            other => {
                warn!(
                    "dry run: cannot predict output of builder type {:?}, reporting the input image",
                    other
                );
                input.clone()
            }
        }
    }
}

/// Drives packer builds.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackerEngine;

impl PackerEngine {
    fn version(ctx: &BuildContext<'_>) -> String {
        ctx.config
            .engine
            .version
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| {
                ctx.defaults
                    .get("packer", "version")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| DEFAULT_PACKER_VERSION.to_string())
    }

    fn build(&self, ctx: &BuildContext<'_>) -> anyhow::Result<Image> {
        let scratch = ctx.scratch("packer")?;
        let manifest_path = scratch.join(MANIFEST_FILE);
        let template = PackerTemplate::generate(ctx, &manifest_path)?;
        let template_path = scratch.join(TEMPLATE_FILE);
        let json = template.to_json()?;
        debug!("packer template:\n{}", json);
        fs::write(&template_path, json)
            .with_context(|| format!("writing '{}'", template_path.display()))?;

        let version = Self::version(ctx);
        ctx.run(
            &CommandSpec::new(ctx.tool(PACKER, Some(&version)))
                .arg("build")
                .path_arg(&template_path)
                .current_dir(scratch.path()),
        )?;

        let manifest = Manifest::load(&manifest_path)?;
        manifest.image()
    }
}

impl Engine for PackerEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Packer
    }

    fn required_tools(&self, ctx: &BuildContext<'_>) -> Vec<(Tool, Option<String>)> {
        vec![(PACKER, Some(Self::version(ctx)))]
    }

    fn configure(&self, ctx: &BuildContext<'_>) -> Result<Image> {
        ctx.input.require_complete()?;

        if ctx.dry_run {
            let template = PackerTemplate::generate(ctx, Path::new(MANIFEST_FILE))?;
            let json = template
                .to_json()
                .map_err(engine_err(EngineKind::Packer, "template"))?;
            info!("dry run: packer template\n{}", json);
            return Ok(template.planned_image(&ctx.input));
        }

        info!("packer {}: building from {}", Self::version(ctx), ctx.input);
        self.build(ctx).map_err(|source| match source.downcast::<BuildError>() {
            Ok(err) => err,
            Err(source) => BuildError::engine(EngineKind::Packer.as_str(), "configure", source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::context;
    use crate::image::ImageKind;
    use crate::process::testing::RecordingRunner;
    use crate::process::CommandOutput;

    fn ami_input() -> Image {
        Image::Ami(AmiImage {
            region: Some("us-east-1".into()),
            id: Some("ami-base".into()),
        })
    }

    fn with_builders(ctx: &mut BuildContext<'_>, builders: Value) {
        ctx.raw["engine"] = json!({ "kind": "packer", "builders": builders });
    }

    #[test]
    fn builder_options_are_layered() {
        let runner = RecordingRunner::new();
        let mut ctx = context(&runner, EngineKind::Packer, ami_input(), true);
        with_builders(
            &mut ctx,
            json!({"amazon-ebs": {"instance_type": "m5.large", "region": "eu-west-1"}}),
        );
        let template = PackerTemplate::generate(&ctx, Path::new("/tmp/m.json")).unwrap();
        let builder = &template.builders[0];
        assert_eq!(builder["type"], "amazon-ebs");
        assert_eq!(builder["source_ami"], "ami-base");
        // user beats input, input beats defaults
        assert_eq!(builder["region"], "eu-west-1");
        assert_eq!(builder["instance_type"], "m5.large");
        assert_eq!(builder["communicator"], "ssh");
        assert_eq!(template.post_processors[0]["output"], "/tmp/m.json");
        assert_eq!(template.provisioners[0]["type"], "shell");
    }

    #[test]
    fn builders_are_required() {
        let runner = RecordingRunner::new();
        let ctx = context(&runner, EngineKind::Packer, ami_input(), true);
        let err = PackerEngine.configure(&ctx).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Config);
        assert!(err.to_string().contains("at least 1 builder"));
    }

    #[test]
    fn dry_run_plans_without_running() {
        let runner = RecordingRunner::new();
        let mut ctx = context(&runner, EngineKind::Packer, ami_input(), true);
        with_builders(&mut ctx, json!({"amazon-ebs": null}));
        let image = PackerEngine.configure(&ctx).unwrap();
        assert_eq!(image.kind(), ImageKind::Ami);
        assert_eq!(image.to_string(), "us-east-1:ami-dry-run");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn build_reads_manifest() {
        let runner = RecordingRunner::new().respond("packer", |spec| {
            let template: Value =
                serde_json::from_str(&fs::read_to_string(&spec.args[1]).unwrap()).unwrap();
            let manifest = template["post-processors"][0]["output"].as_str().unwrap();
            fs::write(
                manifest,
                r#"{"builds": [{"name": "amazon-ebs", "builder_type": "amazon-ebs",
                    "artifact_id": "us-east-1:ami-new", "packer_run_uuid": "r1"}],
                   "last_run_uuid": "r1"}"#,
            )
            .unwrap();
            CommandOutput::ok("")
        });
        let mut ctx = context(&runner, EngineKind::Packer, ami_input(), false);
        with_builders(&mut ctx, json!({"amazon-ebs": {}}));
        let image = PackerEngine.configure(&ctx).unwrap();
        assert_eq!(image.to_string(), "us-east-1:ami-new");
        assert_eq!(runner.programs(), ["packer"]);
    }

    #[test]
    fn version_precedence() {
        let runner = RecordingRunner::new();
        let mut ctx = context(&runner, EngineKind::Packer, ami_input(), true);
        assert_eq!(PackerEngine::version(&ctx), "1.5.5");
        ctx.config.engine.version = Some("1.9.4".into());
        assert_eq!(PackerEngine::version(&ctx), "1.9.4");
        let tools = PackerEngine.required_tools(&ctx);
        assert_eq!(tools[0].1.as_deref(), Some("1.9.4"));
    }
}
