use std::fs;

use anyhow::Context;
use serde_json::Value;
use tracing::info;

use super::{engine_err, Engine, EngineKind};
use crate::build::{now_utc_compact, BuildContext};
use crate::error::{BuildError, Result};
use crate::image::{DockerImage, Image};
use crate::process::CommandSpec;
use crate::tools::{Tool, DOCKER};

const SCRIPT_NAME: &str = "provision.sh";

/// Builds container images with `docker build` on top of the input image.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerEngine;

/// Dockerfile that runs the provisioning script once on top of `base`.
pub fn dockerfile(base: &str) -> String {
    format!(
        "FROM {base}\n\
         LABEL org.opencontainers.image.base.name=\"{base}\"\n\
         COPY {SCRIPT_NAME} /tmp/distro-imager-{SCRIPT_NAME}\n\
         RUN sh /tmp/distro-imager-{SCRIPT_NAME} && rm -f /tmp/distro-imager-{SCRIPT_NAME}\n"
    )
}

impl DockerEngine {
    fn base(ctx: &BuildContext<'_>) -> Result<String> {
        match &ctx.input {
            Image::Docker(_) => Ok(ctx.input.require_complete()?.to_string()),
            other => Err(BuildError::invalid_config(format!(
                "docker engine needs a docker input image, got {}",
                other.kind()
            ))),
        }
    }

    fn target(ctx: &BuildContext<'_>) -> DockerImage {
        let name = ctx
            .engine_option("image")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-image", ctx.distro_name));
        DockerImage {
            image: Some(name),
            tag: Some(now_utc_compact()),
        }
    }
}

impl Engine for DockerEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Docker
    }

    fn required_tools(&self, _ctx: &BuildContext<'_>) -> Vec<(Tool, Option<String>)> {
        vec![(DOCKER, None)]
    }

    fn configure(&self, ctx: &BuildContext<'_>) -> Result<Image> {
        let base = Self::base(ctx)?;
        let target = Image::Docker(Self::target(ctx));
        info!("docker: {} -> {}", base, target);

        if ctx.dry_run {
            info!("dry run: skipping docker build");
            return Ok(target);
        }

        let build = || -> anyhow::Result<()> {
            let scratch = ctx.scratch("docker")?;
            fs::write(scratch.join("Dockerfile"), dockerfile(&base))
                .context("writing Dockerfile")?;
            fs::write(scratch.join(SCRIPT_NAME), ctx.provisioning_script())
                .context("writing provisioning script")?;
            ctx.run(
                &CommandSpec::new(ctx.tool(DOCKER, None))
                    .args(["build", "--tag", &target.to_string()])
                    .path_arg(scratch.path()),
            )?;
            Ok(())
        };
        build().map_err(engine_err(EngineKind::Docker, "configure"))?;
        Ok(target)
    }
}
