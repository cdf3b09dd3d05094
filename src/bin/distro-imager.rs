//! distro-imager CLI
//!
//! ```bash
//! # Build from image-builder.yaml in the current directory
//! distro-imager build
//!
//! # Merge two documents and override a field, without running anything
//! distro-imager build -c base.yaml -c aws.yaml -e input.region=us-west-2 --dry-run
//!
//! # List the distro profiles
//! distro-imager distros
//! ```
//!
//! On success `build` prints only the final image's canonical string, so it
//! can be captured by scripts. Logs go to stderr.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing_subscriber::EnvFilter;

use distro_imager::assets::{AssetSource, DirAssets, EmbeddedAssets};
use distro_imager::build::{BuildRequest, CancelToken, Orchestrator};
use distro_imager::config::{Override, DEFAULT_CONFIG_PATH};
use distro_imager::convert::ConverterRegistry;
use distro_imager::distro::DistroRegistry;
use distro_imager::engine::{EngineDefaults, EngineRegistry};
use distro_imager::process::SystemRunner;
use distro_imager::provision::ProvisioningTable;

#[derive(Parser)]
#[command(name = "distro-imager")]
#[command(author, version, about = "Multi-platform image builder", long_about = None)]
struct Cli {
    /// Log at debug level and keep temporary build files
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Load distro profiles and defaults from this directory
    #[arg(long, global = true, value_name = "DIR")]
    assets: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image and print its canonical name
    Build {
        /// Config document; repeat to merge several, later ones win
        #[arg(short, long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
        config: Vec<PathBuf>,

        /// Resolve everything and report the planned image without side effects
        #[arg(long)]
        dry_run: bool,

        /// Override a config field, e.g. `engine.kind=noop`
        #[arg(short, long = "extra", value_name = "KEY=VALUE")]
        extra: Vec<Override>,

        /// Give up after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// List the known distro profiles
    Distros,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Build {
            config,
            dry_run,
            extra,
            timeout,
        } => cmd_build(
            cli.assets,
            BuildRequest {
                config_paths: config,
                overrides: extra,
                dry_run,
                keep_artifacts: cli.verbose,
            },
            timeout,
        ),
        Commands::Distros => cmd_distros(cli.assets),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    if let Err(e) = tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init()
    {
        eprintln!("warning: failed to initialize logging: {}", e);
    }
}

fn asset_source(dir: Option<PathBuf>) -> Box<dyn AssetSource> {
    match dir {
        Some(dir) => Box::new(DirAssets::new(dir)),
        None => Box::new(EmbeddedAssets),
    }
}

fn cmd_build(assets: Option<PathBuf>, request: BuildRequest, timeout: Option<u64>) -> Result<()> {
    let mut cancel = CancelToken::new();
    if let Some(secs) = timeout {
        cancel = cancel.with_timeout(Duration::from_secs(secs));
    }
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, cancel.flag())
            .with_context(|| format!("registering handler for signal {signal}"))?;
    }

    let defaults = EngineDefaults::load(asset_source(assets.clone()).as_ref())?;
    let distros = DistroRegistry::new(asset_source(assets));
    let engines = EngineRegistry::new();
    let converters = ConverterRegistry::new();
    let provisioning = ProvisioningTable::builtin();
    let runner = SystemRunner::new(cancel.clone());

    let outcome = Orchestrator::new(
        &distros,
        &engines,
        &converters,
        &provisioning,
        &defaults,
        &runner,
    )
    .with_cancel(cancel)
    .run(&request);

    if let Some(stage) = outcome.failed_at() {
        tracing::debug!("failed after {}", stage);
    }
    let image = outcome.into_result()?;

    let mut stdout = std::io::stdout().lock();
    write!(stdout, "{}", image).context("writing result")?;
    stdout.flush().context("writing result")?;
    Ok(())
}

fn cmd_distros(assets: Option<PathBuf>) -> Result<()> {
    let distros = DistroRegistry::new(asset_source(assets));
    for (name, distro) in distros.distributions()? {
        println!("{name}\t{}\t{}", distro.os, distro.distribution_version);
    }
    Ok(())
}
