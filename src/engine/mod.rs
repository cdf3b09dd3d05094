//! Build engines.
//!
//! The set of engines is closed: [`EngineKind`] names every variant and
//! [`EngineRegistry`] maps each one to its implementation with an exhaustive
//! match. An engine turns the merged input image into a realized image of its
//! native kind; all side effects of a build happen inside
//! [`Engine::configure`].

mod docker;
mod noop;
mod packer;
mod qemu;

pub use docker::DockerEngine;
pub use noop::NoopEngine;
pub use packer::{PackerEngine, PackerTemplate};
pub use qemu::QemuEngine;
pub(crate) use qemu::QemuSettings;

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::assets::{AssetSource, DEFAULTS_FILE};
use crate::build::BuildContext;
use crate::error::{BuildError, Result};
use crate::image::Image;
use crate::tools::Tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Qemu,
    Docker,
    Packer,
    Noop,
}

impl EngineKind {
    pub const ALL: [EngineKind; 4] = [
        EngineKind::Qemu,
        EngineKind::Docker,
        EngineKind::Packer,
        EngineKind::Noop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Qemu => "qemu",
            EngineKind::Docker => "docker",
            EngineKind::Packer => "packer",
            EngineKind::Noop => "noop",
        }
    }

    pub fn from_name(name: &str) -> Option<EngineKind> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Engine names, sorted.
    pub fn names() -> Vec<String> {
        let mut names: Vec<String> = Self::ALL.iter().map(|k| k.as_str().to_string()).collect();
        names.sort();
        names
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A build engine.
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Host tools this engine needs for `ctx`, each with an optional version.
    fn required_tools(&self, ctx: &BuildContext<'_>) -> Vec<(Tool, Option<String>)>;

    /// Perform the build and return the realized image.
    ///
    /// With `ctx.dry_run` set, compute the image that would be produced
    /// without spawning processes or touching the filesystem.
    fn configure(&self, ctx: &BuildContext<'_>) -> Result<Image>;
}

/// Fixed table of every engine, built once at startup.
#[derive(Debug, Default)]
pub struct EngineRegistry {
    qemu: QemuEngine,
    docker: DockerEngine,
    packer: PackerEngine,
    noop: NoopEngine,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EngineKind) -> &dyn Engine {
        match kind {
            EngineKind::Qemu => &self.qemu,
            EngineKind::Docker => &self.docker,
            EngineKind::Packer => &self.packer,
            EngineKind::Noop => &self.noop,
        }
    }

    /// Look up an engine by name, see [`EngineConfig::kind_or_default`].
    ///
    /// [`EngineConfig::kind_or_default`]: crate::config::EngineConfig::kind_or_default
    pub fn select(&self, name: &str) -> Result<&dyn Engine> {
        EngineKind::from_name(name)
            .map(|kind| self.get(kind))
            .ok_or_else(|| BuildError::UnknownEngine {
                kind: name.to_string(),
                available: EngineKind::names(),
            })
    }
}

/// Per-engine default options (engine name -> option table).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineDefaults {
    tables: BTreeMap<String, Map<String, Value>>,
}

impl EngineDefaults {
    pub fn load(source: &dyn AssetSource) -> Result<Self> {
        let text = source.read_to_string(DEFAULTS_FILE)?;
        let tables: BTreeMap<String, Map<String, Value>> =
            toml::from_str(&text).map_err(|e| BuildError::Asset {
                path: DEFAULTS_FILE.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { tables })
    }

    pub fn table(&self, engine: &str) -> Option<&Map<String, Value>> {
        self.tables.get(engine)
    }

    pub fn get(&self, engine: &str, key: &str) -> Option<&Value> {
        self.table(engine).and_then(|t| t.get(key))
    }

    /// Nested table under `engine`, e.g. `packer.builders.<name>`.
    pub fn nested(&self, engine: &str, path: &[&str]) -> Option<&Map<String, Value>> {
        let mut cursor = self.table(engine)?;
        for key in path {
            cursor = cursor.get(*key)?.as_object()?;
        }
        Some(cursor)
    }
}

/// Wrap an engine's opaque failure with the stage it happened in.
pub(crate) fn engine_err(
    kind: EngineKind,
    stage: &'static str,
) -> impl FnOnce(anyhow::Error) -> BuildError {
    move |source| BuildError::engine(kind.as_str(), stage, source)
}
