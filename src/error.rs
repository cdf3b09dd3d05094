//! Error taxonomy for a build run.
//!
//! Every stage returns a [`BuildError`]; the orchestrator aborts on the first
//! one it sees. Failures coming from external tools stay opaque
//! (`anyhow::Error`) and are wrapped with the stage that produced them.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

/// Coarse classification used for reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Resolution,
    Conversion,
    Engine,
    Asset,
    Cancelled,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Config => "config",
            ErrorCategory::Resolution => "resolution",
            ErrorCategory::Conversion => "conversion",
            ErrorCategory::Engine => "engine",
            ErrorCategory::Asset => "asset",
            ErrorCategory::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum BuildError {
    // Config errors
    #[error("reading config '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config '{path}': {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    #[error("cannot override '{path}': {reason}")]
    Override { path: String, reason: String },

    #[error("{kind} image is missing required fields: {}", missing.join(", "))]
    IncompleteImage {
        kind: String,
        missing: Vec<&'static str>,
    },

    // Resolution errors
    #[error("unknown image kind '{kind}', expected one of: {}", expected.join(", "))]
    UnknownImageKind { kind: String, expected: Vec<String> },

    #[error("unknown distro name '{name}', valid options are: {}", known.join(", "))]
    UnknownDistro { name: String, known: Vec<String> },

    #[error("unknown engine '{kind}', available engines: {}", available.join(", "))]
    UnknownEngine {
        kind: String,
        available: Vec<String>,
    },

    #[error("unsupported OS for provisioning '{os}', supported OS: {}", supported.join(", "))]
    UnsupportedOs { os: String, supported: Vec<String> },

    // Conversion errors
    #[error("no converter from {from} to {to}")]
    UnsupportedConversion { from: String, to: String },

    #[error("converting {from} to {to}")]
    ConversionFailed {
        from: String,
        to: String,
        #[source]
        source: anyhow::Error,
    },

    // Engine errors
    #[error("engine '{engine}' failed during {stage}")]
    Engine {
        engine: String,
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    // Asset errors
    #[error("loading asset '{path}': {reason}")]
    Asset { path: String, reason: String },

    #[error("build cancelled before {stage}")]
    Cancelled { stage: String },
}

impl BuildError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BuildError::ConfigRead { .. }
            | BuildError::ConfigParse { .. }
            | BuildError::InvalidConfig { .. }
            | BuildError::Override { .. }
            | BuildError::IncompleteImage { .. } => ErrorCategory::Config,
            BuildError::UnknownImageKind { .. }
            | BuildError::UnknownDistro { .. }
            | BuildError::UnknownEngine { .. }
            | BuildError::UnsupportedOs { .. } => ErrorCategory::Resolution,
            BuildError::UnsupportedConversion { .. } | BuildError::ConversionFailed { .. } => {
                ErrorCategory::Conversion
            }
            BuildError::Engine { .. } => ErrorCategory::Engine,
            BuildError::Asset { .. } => ErrorCategory::Asset,
            BuildError::Cancelled { .. } => ErrorCategory::Cancelled,
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        BuildError::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn engine(engine: &str, stage: &'static str, source: anyhow::Error) -> Self {
        BuildError::Engine {
            engine: engine.to_string(),
            stage,
            source,
        }
    }
}
