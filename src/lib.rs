//! Builds machine and container images for several platforms from one
//! declarative config.
//!
//! A run resolves the config, picks an engine and a distro profile, fills the
//! input image from the distro's template, builds with the engine and then
//! converts the result into every requested output, in order:
//!
//! - **Config** - YAML/TOML documents merged in order, plus `path=value` overrides
//! - **Distro profiles** - Named OS releases with per-kind image templates
//! - **Engines** - qemu, docker, packer and a no-op engine
//! - **Converters** - Disk, OVA, GCE and AMI conversions chosen by kind pair
//! - **Orchestrator** - The stage sequence, with partial results on failure
//!
//! # Architecture
//!
//! ```text
//! config files + overrides
//!     │
//!     ▼
//! ResolvedConfig ──► EngineRegistry ──► DistroRegistry ──► template merge
//!                                                              │
//!                                                              ▼
//!                          ConversionChain ◄── Engine::configure(BuildContext)
//!                                 │
//!                                 ▼
//!                        final image (stdout)
//! ```
//!
//! External tools are run through [`process::CommandRunner`], so a dry run
//! or a test never spawns anything.
//!
//! # Example
//!
//! ```rust,ignore
//! use distro_imager::build::{BuildRequest, Orchestrator};
//!
//! let outcome = orchestrator.run(&BuildRequest {
//!     config_paths: vec!["image-builder.yaml".into()],
//!     dry_run: true,
//!     ..Default::default()
//! });
//! println!("{}", outcome.into_result()?);
//! ```

pub mod assets;
pub mod build;
pub mod config;
pub mod convert;
pub mod distro;
pub mod engine;
pub mod error;
pub mod image;
pub mod manifest;
pub mod preflight;
pub mod process;
pub mod provision;
pub mod tools;

pub use build::{BuildContext, BuildOutcome, BuildRequest, BuildState, CancelToken, Orchestrator};
pub use error::{BuildError, ErrorCategory, Result};
pub use image::{Image, ImageKind};
