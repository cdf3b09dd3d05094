//! `key=value` overrides from the command line.
//!
//! Paths resolve through a fixed table of known keys, each bound to a typed
//! slot in [`BuildConfig`]. Only text, integer and boolean targets are
//! accepted; list-typed fields cannot be overridden. The new value is written
//! to the raw map at the same path so generic lookups see it too.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, info};

use super::{BuildConfig, ResolvedConfig};
use crate::error::{BuildError, Result};
use crate::image::ImageDescriptor;

/// One `path=value` pair, kept in command-line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pub path: String,
    pub value: String,
}

impl FromStr for Override {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        let (path, value) = s.split_once('=').ok_or_else(|| BuildError::Override {
            path: s.to_string(),
            reason: "expected the form key=value".to_string(),
        })?;
        let path = path.trim();
        if path.is_empty() {
            return Err(BuildError::Override {
                path: s.to_string(),
                reason: "empty key".to_string(),
            });
        }
        Ok(Override {
            path: path.to_string(),
            value: value.to_string(),
        })
    }
}

impl fmt::Display for Override {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.path, self.value)
    }
}

const DESCRIPTOR_FIELDS: &[&str] = &[
    "kind",
    "region",
    "id",
    "path",
    "format",
    "checksum",
    "project",
    "image",
    "bucket",
    "publisher",
    "offer",
    "sku",
    "tag",
    "url",
];

const SCALAR_PATHS: &[&str] = &[
    "distro",
    "output_dir",
    "engine.kind",
    "engine.version",
    "engine.cpus",
    "engine.memory_mb",
    "engine.disk_size_mb",
    "engine.headless",
    "provisioning.hostname",
];

/// Paths that name list-typed fields.
const SEQUENCE_PATHS: &[&str] = &[
    "output",
    "provisioning.packages",
    "provisioning.commands",
    "provisioning.tags",
];

/// Every key accepted by [`apply_overrides`].
pub fn known_paths() -> Vec<String> {
    let mut paths: Vec<String> = SCALAR_PATHS.iter().map(|p| p.to_string()).collect();
    paths.extend(DESCRIPTOR_FIELDS.iter().map(|f| format!("input.{f}")));
    paths.push("variables.<name>".to_string());
    paths
}

enum Slot<'a> {
    Text(&'a mut Option<String>),
    Name(&'a mut String),
    U32(&'a mut Option<u32>),
    U64(&'a mut Option<u64>),
    Bool(&'a mut Option<bool>),
    Variable(&'a mut serde_json::Map<String, Value>, String),
}

impl Slot<'_> {
    fn type_name(&self) -> &'static str {
        match self {
            Slot::Text(_) | Slot::Name(_) | Slot::Variable(..) => "text",
            Slot::U32(_) | Slot::U64(_) => "integer",
            Slot::Bool(_) => "boolean",
        }
    }

    fn current(&self) -> String {
        fn show<T: ToString>(value: Option<&T>) -> String {
            value.map(ToString::to_string).unwrap_or_default()
        }
        match self {
            Slot::Text(v) => show(v.as_ref()),
            Slot::Name(v) => v.to_string(),
            Slot::U32(v) => show(v.as_ref()),
            Slot::U64(v) => show(v.as_ref()),
            Slot::Bool(v) => show(v.as_ref()),
            Slot::Variable(map, key) => show(map.get(key.as_str())),
        }
    }

    /// Coerce `literal` into the slot's type and store it.
    fn set(self, literal: &str) -> std::result::Result<Value, String> {
        match self {
            Slot::Text(_) | Slot::Name(_) if literal.trim().is_empty() => {
                Err("an empty value is not allowed".to_string())
            }
            Slot::Text(slot) => {
                *slot = Some(literal.to_string());
                Ok(Value::from(literal))
            }
            Slot::Name(slot) => {
                *slot = literal.to_string();
                Ok(Value::from(literal))
            }
            Slot::U32(slot) => {
                let n = parse_integer(literal)?;
                let n = u32::try_from(n).map_err(|_| format!("{n} is out of range"))?;
                *slot = Some(n);
                Ok(Value::from(n))
            }
            Slot::U64(slot) => {
                let n = parse_integer(literal)?;
                let n = u64::try_from(n).map_err(|_| format!("{n} is out of range"))?;
                *slot = Some(n);
                Ok(Value::from(n))
            }
            Slot::Bool(slot) => {
                let b = parse_bool(literal)?;
                *slot = Some(b);
                Ok(Value::Bool(b))
            }
            Slot::Variable(map, key) => {
                map.insert(key, Value::from(literal));
                Ok(Value::from(literal))
            }
        }
    }
}

fn parse_integer(literal: &str) -> std::result::Result<i64, String> {
    literal
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("cannot convert '{literal}' to an integer"))
}

/// Accepts the usual spellings: 1/0, t/f, true/false in any common case.
fn parse_bool(literal: &str) -> std::result::Result<bool, String> {
    match literal.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(format!("cannot convert '{literal}' to a boolean")),
    }
}

fn descriptor_slot<'a>(descriptor: &'a mut ImageDescriptor, field: &str) -> Option<Slot<'a>> {
    let slot = match field {
        "kind" => &mut descriptor.kind,
        "region" => &mut descriptor.region,
        "id" => &mut descriptor.id,
        "path" => &mut descriptor.path,
        "format" => &mut descriptor.format,
        "checksum" => &mut descriptor.checksum,
        "project" => &mut descriptor.project,
        "image" => &mut descriptor.image,
        "bucket" => &mut descriptor.bucket,
        "publisher" => &mut descriptor.publisher,
        "offer" => &mut descriptor.offer,
        "sku" => &mut descriptor.sku,
        "tag" => &mut descriptor.tag,
        "url" => &mut descriptor.url,
        _ => return None,
    };
    Some(Slot::Text(slot))
}

fn resolve_slot<'a>(
    config: &'a mut BuildConfig,
    variables: &'a mut serde_json::Map<String, Value>,
    path: &str,
) -> Option<Slot<'a>> {
    let slot = match path {
        "distro" => Slot::Name(&mut config.distro),
        "output_dir" => Slot::Text(&mut config.output_dir),
        "engine.kind" => Slot::Text(&mut config.engine.kind),
        "engine.version" => Slot::Text(&mut config.engine.version),
        "engine.cpus" => Slot::U32(&mut config.engine.cpus),
        "engine.memory_mb" => Slot::U32(&mut config.engine.memory_mb),
        "engine.disk_size_mb" => Slot::U64(&mut config.engine.disk_size_mb),
        "engine.headless" => Slot::Bool(&mut config.engine.headless),
        "provisioning.hostname" => Slot::Text(&mut config.provisioning.hostname),
        _ => {
            if let Some(field) = path.strip_prefix("input.") {
                return descriptor_slot(&mut config.input, field);
            }
            if let Some(name) = path.strip_prefix("variables.") {
                if name.is_empty() || name.contains('.') {
                    return None;
                }
                return Some(Slot::Variable(variables, name.to_string()));
            }
            return None;
        }
    };
    Some(slot)
}

fn is_sequence_path(path: &str) -> bool {
    SEQUENCE_PATHS.iter().any(|seq| {
        path == *seq
            || path
                .strip_prefix(seq)
                .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('['))
    })
}

/// Write `value` into the raw map at a dotted `path`, creating objects as needed.
fn set_raw_path(raw: &mut Value, path: &str, value: Value) {
    let mut cursor = raw;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !cursor.is_object() {
            *cursor = Value::Object(Default::default());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        cursor = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
}

fn apply_one(resolved: &mut ResolvedConfig, ov: &Override) -> Result<()> {
    let fail = |reason: String| BuildError::Override {
        path: ov.path.clone(),
        reason,
    };

    if is_sequence_path(&ov.path) {
        return Err(fail(
            "list-typed fields cannot be overridden from the command line".to_string(),
        ));
    }

    // Free-form variables go through a JSON map so the slot can insert keys.
    let mut variables: serde_json::Map<String, Value> =
        std::mem::take(&mut resolved.config.variables)
            .into_iter()
            .collect();

    let outcome = match resolve_slot(&mut resolved.config, &mut variables, &ov.path) {
        None => Err(fail(format!(
            "unknown key, expected one of: {}",
            known_paths().join(", ")
        ))),
        Some(slot) => {
            let previous = slot.current();
            let type_name = slot.type_name();
            debug!("looking up {} ({}) to set it to: {}", ov.path, type_name, ov.value);
            match slot.set(&ov.value) {
                Ok(value) => {
                    info!("overriding {} {:?} => {:?}", ov.path, previous, ov.value);
                    Ok(value)
                }
                Err(reason) => Err(fail(format!("{reason} for {type_name} field"))),
            }
        }
    };

    resolved.config.variables = variables.into_iter().collect();
    let value = outcome?;
    set_raw_path(&mut resolved.raw, &ov.path, value);
    Ok(())
}

/// Apply overrides in order. The first failure aborts: continuing would
/// operate on an ill-defined config.
pub fn apply_overrides(resolved: &mut ResolvedConfig, overrides: &[Override]) -> Result<()> {
    for ov in overrides {
        apply_one(resolved, ov)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_document, DocumentFormat};
    use std::path::Path;

    fn resolved(text: &str) -> ResolvedConfig {
        parse_document(text, DocumentFormat::Yaml, Path::new("t.yaml")).unwrap()
    }

    fn ov(s: &str) -> Override {
        s.parse().unwrap()
    }

    #[test]
    fn parses_key_value_pairs() {
        let o = ov("input.path=/a=b");
        assert_eq!(o.path, "input.path");
        assert_eq!(o.value, "/a=b");
        assert!("novalue".parse::<Override>().is_err());
        assert!("=x".parse::<Override>().is_err());
    }

    #[test]
    fn coerces_text_integer_and_boolean() {
        let mut r = resolved("distro: ubuntu1804\n");
        apply_overrides(
            &mut r,
            &[
                ov("distro=debian10"),
                ov("engine.cpus=4"),
                ov("engine.headless=false"),
                ov("input.region=eu-central-1"),
                ov("variables.owner=ops"),
            ],
        )
        .unwrap();
        assert_eq!(r.config.distro, "debian10");
        assert_eq!(r.config.engine.cpus, Some(4));
        assert_eq!(r.config.engine.headless, Some(false));
        assert_eq!(r.config.input.region.as_deref(), Some("eu-central-1"));
        assert_eq!(r.config.variables["owner"], "ops");
        assert_eq!(r.raw, serde_json::to_value(&r.config).unwrap());
    }

    #[test]
    fn later_overrides_win() {
        let mut r = resolved("");
        apply_overrides(&mut r, &[ov("engine.kind=docker"), ov("engine.kind=noop")]).unwrap();
        assert_eq!(r.config.engine.kind.as_deref(), Some("noop"));
    }

    #[test]
    fn unknown_path_is_fatal_and_named() {
        let mut r = resolved("");
        let err = apply_overrides(&mut r, &[ov("engine.colour=blue")]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("engine.colour"));
        assert!(msg.contains("engine.cpus"));
    }

    #[test]
    fn type_mismatch_is_fatal() {
        let mut r = resolved("");
        let err = apply_overrides(&mut r, &[ov("engine.cpus=many")]).unwrap_err();
        assert!(err.to_string().contains("integer"));
        let err = apply_overrides(&mut r, &[ov("engine.headless=maybe")]).unwrap_err();
        assert!(err.to_string().contains("boolean"));
        let err = apply_overrides(&mut r, &[ov("engine.cpus=-1")]).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn empty_text_values_are_rejected() {
        let mut r = resolved("distro: ubuntu1804\nengine:\n  kind: docker\n");
        for path in ["engine.kind=", "distro= ", "input.region="] {
            let err = apply_overrides(&mut r, &[ov(path)]).unwrap_err();
            assert!(err.to_string().contains("empty value"), "{path}");
        }
        assert_eq!(r.config.engine.kind.as_deref(), Some("docker"));
        assert_eq!(r.config.distro, "ubuntu1804");
        assert_eq!(r.raw, serde_json::to_value(&r.config).unwrap());
    }

    #[test]
    fn sequence_fields_are_rejected() {
        let mut r = resolved("output:\n  - kind: ova\n");
        for path in ["output=x", "output.0.kind=iso", "provisioning.packages=vim"] {
            let err = apply_overrides(&mut r, &[ov(path)]).unwrap_err();
            assert!(err.to_string().contains("list-typed"), "{path}");
        }
        assert_eq!(r.config.output.len(), 1);
    }

    #[test]
    fn known_paths_all_resolve() {
        let mut config = BuildConfig::default();
        let mut vars = serde_json::Map::new();
        for path in known_paths() {
            let path = path.replace("<name>", "x");
            assert!(
                resolve_slot(&mut config, &mut vars, &path).is_some(),
                "{path}"
            );
        }
    }
}
