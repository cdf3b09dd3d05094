//! Build configuration: loading, merging and overrides.
//!
//! Each document is parsed twice over the same data: once into the typed
//! [`BuildConfig`] and once into a schema-less [`serde_json::Value`] (the raw
//! map). The raw map is produced by serializing the typed config, so every
//! typed field is reflected there, and both are merged in lock-step.
//!
//! ```yaml
//! distro: ubuntu1804
//! input:
//!   kind: qemu
//! output:
//!   - kind: ova
//! engine:
//!   kind: qemu
//!   cpus: 2
//! provisioning:
//!   packages: [curl]
//! ```

pub mod merge;
pub mod overrides;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{BuildError, Result};
use crate::image::{is_unset, ImageDescriptor};
use crate::provision::ProvisioningSpec;

pub use merge::{merge_values, Merge};
pub use overrides::{apply_overrides, Override};

/// Config path used when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "image-builder.yaml";

/// Engine used when `engine.kind` is unset.
pub const DEFAULT_ENGINE_KIND: &str = "qemu";

/// User-supplied build description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub input: ImageDescriptor,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<ImageDescriptor>,
    pub engine: EngineConfig,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub distro: String,
    pub provisioning: ProvisioningSpec,
    /// Free-form values handed to engines untouched.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
    /// Directory for locally produced artifacts (default: current directory).
    #[serde(skip_serializing_if = "is_unset")]
    pub output_dir: Option<String>,
}

/// Engine selection plus engine-specific options.
///
/// Anything not named here (e.g. packer `builders`) lands in `options` and is
/// read by the engine that understands it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(skip_serializing_if = "is_unset")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
    #[serde(flatten)]
    pub options: BTreeMap<String, Value>,
}

impl EngineConfig {
    /// Engine kind with the default applied.
    pub fn kind_or_default(&self) -> &str {
        self.kind
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(DEFAULT_ENGINE_KIND)
    }
}

impl BuildConfig {
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Typed config plus its schema-less mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub config: BuildConfig,
    pub raw: Value,
}

impl ResolvedConfig {
    fn from_config(config: BuildConfig) -> Result<Self> {
        let raw = serde_json::to_value(&config)
            .map_err(|e| BuildError::invalid_config(format!("serializing config: {e}")))?;
        Ok(Self { config, raw })
    }

    /// Merge `other` on top of `self`; set fields in `other` win.
    pub fn merge(&mut self, other: ResolvedConfig) {
        self.config.merge_from(other.config);
        merge_values(&mut self.raw, other.raw);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Toml,
}

impl DocumentFormat {
    /// `.toml` is TOML; everything else is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => DocumentFormat::Toml,
            _ => DocumentFormat::Yaml,
        }
    }
}

/// Parse one document held in memory. `origin` is used in error messages.
pub fn parse_document(
    text: &str,
    format: DocumentFormat,
    origin: &Path,
) -> Result<ResolvedConfig> {
    let parse_err = |reason: String| BuildError::ConfigParse {
        path: origin.to_path_buf(),
        reason,
    };

    if text.trim().is_empty() {
        return ResolvedConfig::from_config(BuildConfig::default());
    }

    let value: Value = match format {
        DocumentFormat::Yaml => serde_yaml::from_str(text).map_err(|e| parse_err(e.to_string()))?,
        DocumentFormat::Toml => {
            let table: toml::Table = toml::from_str(text).map_err(|e| parse_err(e.to_string()))?;
            serde_json::to_value(table).map_err(|e| parse_err(e.to_string()))?
        }
    };
    if !value.is_object() && !value.is_null() {
        return Err(parse_err(format!(
            "expected a mapping at the document root, found {}",
            json_type_name(&value)
        )));
    }
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };

    let config: BuildConfig =
        serde_json::from_value(value).map_err(|e| parse_err(e.to_string()))?;
    ResolvedConfig::from_config(config)
}

/// Read and parse one document from disk.
pub fn load_document(path: &Path) -> Result<ResolvedConfig> {
    let text = fs::read_to_string(path).map_err(|source| BuildError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("loaded config document '{}'", path.display());
    parse_document(&text, DocumentFormat::from_path(path), path)
}

/// Load every document in argument order and merge them into one.
pub fn resolve(paths: &[PathBuf]) -> Result<ResolvedConfig> {
    let mut iter = paths.iter();
    let first = iter
        .next()
        .ok_or_else(|| BuildError::invalid_config("no config documents given"))?;

    let mut resolved = load_document(first)?;
    for path in iter {
        let next = load_document(path)?;
        resolved.merge(next);
        trace!("merged config document '{}'", path.display());
    }
    Ok(resolved)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn yaml(text: &str) -> ResolvedConfig {
        parse_document(text, DocumentFormat::Yaml, Path::new("test.yaml")).unwrap()
    }

    #[test]
    fn parses_yaml_and_mirrors_raw() {
        let resolved = yaml(
            "distro: ubuntu1804\ninput:\n  kind: qemu\nengine:\n  kind: packer\n  builders:\n    amazon-ebs:\n      instance_type: t3.small\n",
        );
        assert_eq!(resolved.config.distro, "ubuntu1804");
        assert_eq!(resolved.config.input.kind.as_deref(), Some("qemu"));
        assert_eq!(resolved.raw["distro"], "ubuntu1804");
        assert_eq!(resolved.raw["input"]["kind"], "qemu");
        assert_eq!(
            resolved.raw["engine"]["builders"]["amazon-ebs"]["instance_type"],
            "t3.small"
        );
        assert!(resolved.config.engine.options.contains_key("builders"));
    }

    #[test]
    fn parses_toml() {
        let resolved = parse_document(
            "distro = \"debian10\"\n[engine]\nkind = \"noop\"\ncpus = 4\n",
            DocumentFormat::Toml,
            Path::new("build.toml"),
        )
        .unwrap();
        assert_eq!(resolved.config.engine.cpus, Some(4));
        assert_eq!(resolved.config.engine.kind_or_default(), "noop");
    }

    #[test]
    fn rejects_unknown_top_level_fields() {
        let err =
            parse_document("distor: x\n", DocumentFormat::Yaml, Path::new("bad.yaml")).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Config);
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn rejects_non_mapping_root() {
        let err =
            parse_document("- a\n- b\n", DocumentFormat::Yaml, Path::new("list.yaml")).unwrap_err();
        assert!(err.to_string().contains("sequence"));
    }

    #[test]
    fn empty_document_is_default_config() {
        let resolved = yaml("");
        assert_eq!(resolved.config, BuildConfig::default());
        assert_eq!(resolved.config.engine.kind_or_default(), DEFAULT_ENGINE_KIND);
    }

    #[test]
    fn resolve_merges_in_argument_order() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("base.yaml");
        let site = tmp.path().join("site.toml");
        fs::write(&base, "distro: ubuntu1804\ninput:\n  kind: qemu\n  format: qcow2\n").unwrap();
        fs::write(&site, "distro = \"debian10\"\n[input]\npath = \"/srv/base.img\"\n").unwrap();

        let resolved = resolve(&[base, site]).unwrap();
        assert_eq!(resolved.config.distro, "debian10");
        assert_eq!(resolved.config.input.kind.as_deref(), Some("qemu"));
        assert_eq!(resolved.config.input.format.as_deref(), Some("qcow2"));
        assert_eq!(resolved.config.input.path.as_deref(), Some("/srv/base.img"));
        assert_eq!(resolved.raw, serde_json::to_value(&resolved.config).unwrap());
    }

    #[test]
    fn resolve_reports_unreadable_document() {
        let err = resolve(&[PathBuf::from("/nonexistent/image-builder.yaml")]).unwrap_err();
        assert!(matches!(err, BuildError::ConfigRead { .. }));
    }

    #[test]
    fn resolve_requires_a_document() {
        assert!(resolve(&[]).is_err());
    }
}
