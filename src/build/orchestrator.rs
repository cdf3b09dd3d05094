//! The stage sequence for one build run.
//!
//! ```text
//! Init -> ConfigResolved -> EngineSelected -> DistroResolved -> ImageMerged
//!      -> Configured -> Converting(0..N) -> Done | Failed
//! ```
//!
//! Any stage failing aborts the rest. Results produced before the failure
//! (the configured image, finished conversions) stay in the outcome.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::state::{BuildOutcome, BuildState, Progress};
use super::{BuildContext, CancelToken};
use crate::config::{self, apply_overrides, Override, ResolvedConfig};
use crate::convert::{ConversionChain, ConverterRegistry};
use crate::distro::{DistroRegistry, OsFamily};
use crate::engine::{Engine, EngineDefaults, EngineRegistry};
use crate::error::{BuildError, Result};
use crate::image::Image;
use crate::preflight::check_required_tools;
use crate::process::CommandRunner;
use crate::provision::ProvisioningTable;
use crate::tools::Tool;

/// What the caller asked for.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// Config documents, merged in order.
    pub config_paths: Vec<PathBuf>,
    /// `path=value` overrides, applied in order after merging.
    pub overrides: Vec<Override>,
    pub dry_run: bool,
    pub keep_artifacts: bool,
}

/// Drives one run over registries built once at startup.
pub struct Orchestrator<'a> {
    distros: &'a DistroRegistry,
    engines: &'a EngineRegistry,
    converters: &'a ConverterRegistry,
    provisioning: &'a ProvisioningTable,
    defaults: &'a EngineDefaults,
    runner: &'a dyn CommandRunner,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        distros: &'a DistroRegistry,
        engines: &'a EngineRegistry,
        converters: &'a ConverterRegistry,
        provisioning: &'a ProvisioningTable,
        defaults: &'a EngineDefaults,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            distros,
            engines,
            converters,
            provisioning,
            defaults,
            runner,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Load the request's config documents and run.
    pub fn run(&self, request: &BuildRequest) -> BuildOutcome {
        info!(
            "resolving config from {:?}",
            request
                .config_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
        );
        match config::resolve(&request.config_paths) {
            Ok(resolved) => self.run_resolved(resolved, request),
            Err(err) => Progress::new().finish(Err(err)),
        }
    }

    /// Run from an already merged config. Overrides in `request` still apply.
    pub fn run_resolved(&self, resolved: ResolvedConfig, request: &BuildRequest) -> BuildOutcome {
        let mut progress = Progress::new();
        let result = self.drive(&mut progress, resolved, request);
        match &result {
            Ok(image) => info!("build finished: {}", image),
            Err(err) => debug!("build failed after {}: {}", progress.last(), err),
        }
        progress.finish(result)
    }

    fn drive(
        &self,
        progress: &mut Progress,
        mut resolved: ResolvedConfig,
        request: &BuildRequest,
    ) -> Result<Image> {
        self.cancel.check("config resolution")?;
        apply_overrides(&mut resolved, &request.overrides)?;
        let ResolvedConfig { mut config, mut raw } = resolved;
        let mut input = Image::from_descriptor(&config.input)?;
        let outputs = config
            .output
            .iter()
            .map(Image::from_descriptor)
            .collect::<Result<Vec<_>>>()?;
        progress.enter(BuildState::ConfigResolved);

        self.cancel.check("engine selection")?;
        let engine = self.engines.select(config.engine.kind_or_default())?;
        info!("engine: {}", engine.kind());
        progress.enter(BuildState::EngineSelected);

        self.cancel.check("distro resolution")?;
        let distro = self.distros.resolve(&config.distro)?.clone();
        info!("distro: {} ({})", config.distro, distro);
        let family = distro.os_family();
        if family == OsFamily::Fallback {
            warn!(
                "unrecognised OS '{}', provisioning with the fallback (apt) family",
                distro.os
            );
        }
        progress.enter(BuildState::DistroResolved);

        self.cancel.check("image merge")?;
        match distro.template(input.kind()) {
            Some(template) => {
                input.merge_template(&template);
                debug!("input after {} template: {:?}", config.distro, input);
            }
            None => debug!("{} has no {} template", config.distro, input.kind()),
        }
        let os = self.provisioning.lookup(&distro.os)?;
        config.provisioning.inject_tags(os.tags);
        let provisioning = serde_json::to_value(&config.provisioning)
            .map_err(|e| BuildError::invalid_config(format!("serializing provisioning: {e}")))?;
        if let Some(map) = raw.as_object_mut() {
            map.insert("provisioning".to_string(), provisioning);
        }
        input.require_complete()?;
        progress.enter(BuildState::ImageMerged);

        let ctx = BuildContext {
            raw,
            distro_name: config.distro.clone(),
            config,
            input,
            outputs,
            engine: engine.kind(),
            distro,
            family,
            defaults: self.defaults.clone(),
            dry_run: request.dry_run,
            keep_artifacts: request.keep_artifacts,
            cancel: self.cancel.clone(),
            runner: self.runner,
        };

        self.cancel.check("configure")?;
        if !ctx.dry_run {
            self.preflight(engine, &ctx)?;
        }
        info!("configuring {} from {}", engine.kind(), ctx.input);
        let image = engine.configure(&ctx)?;
        info!("configured: {}", image);
        progress.configured = Some(image.clone());
        progress.enter(BuildState::Configured);

        if ctx.outputs.is_empty() {
            return Ok(image);
        }
        let chain = ConversionChain::new(self.converters);
        let outcome = chain.run(&ctx, image, &ctx.outputs, |index| {
            progress.enter(BuildState::Converting(index))
        });
        progress.converted = outcome.produced;
        outcome.result
    }

    fn preflight(&self, engine: &dyn Engine, ctx: &BuildContext<'_>) -> Result<()> {
        let required = engine.required_tools(ctx);
        let tools: Vec<(Tool, Option<&str>)> = required
            .iter()
            .map(|(tool, version)| (*tool, version.as_deref()))
            .collect();
        check_required_tools(&tools)
            .map_err(|source| BuildError::engine(engine.kind().as_str(), "preflight", source))
    }
}
