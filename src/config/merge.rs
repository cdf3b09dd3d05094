//! Field-wise merge of config documents.
//!
//! For a document B merged after A: anything set in B replaces A's value,
//! anything unset (None, empty string, empty list or map) keeps A's value.
//! Nested structs and maps merge recursively. The same rule drives the typed
//! merge and [`merge_values`] so both stay in step.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{BuildConfig, EngineConfig};
use crate::image::ImageDescriptor;
use crate::provision::ProvisioningSpec;

pub trait Merge {
    /// Merge `other` on top of `self`.
    fn merge_from(&mut self, other: Self);
}

/// Deep-merge `overlay` into `base`, skipping unset overlay values.
pub fn merge_values(base: &mut Value, overlay: Value) {
    if is_unset_value(&overlay) {
        return;
    }
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                if is_unset_value(&value) {
                    continue;
                }
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn is_unset_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn text(base: &mut Option<String>, overlay: Option<String>) {
    if let Some(value) = overlay.filter(|v| !v.is_empty()) {
        *base = Some(value);
    }
}

fn scalar<T>(base: &mut Option<T>, overlay: Option<T>) {
    if overlay.is_some() {
        *base = overlay;
    }
}

fn list<T>(base: &mut Vec<T>, overlay: Vec<T>) {
    if !overlay.is_empty() {
        *base = overlay;
    }
}

fn string_map(base: &mut BTreeMap<String, String>, overlay: BTreeMap<String, String>) {
    for (key, value) in overlay {
        if !value.is_empty() {
            base.insert(key, value);
        }
    }
}

fn value_map(base: &mut BTreeMap<String, Value>, overlay: BTreeMap<String, Value>) {
    for (key, value) in overlay {
        if is_unset_value(&value) {
            continue;
        }
        match base.get_mut(&key) {
            Some(existing) => merge_values(existing, value),
            None => {
                base.insert(key, value);
            }
        }
    }
}

impl Merge for ImageDescriptor {
    fn merge_from(&mut self, other: Self) {
        text(&mut self.kind, other.kind);
        text(&mut self.region, other.region);
        text(&mut self.id, other.id);
        text(&mut self.path, other.path);
        text(&mut self.format, other.format);
        text(&mut self.checksum, other.checksum);
        text(&mut self.project, other.project);
        text(&mut self.image, other.image);
        text(&mut self.bucket, other.bucket);
        text(&mut self.publisher, other.publisher);
        text(&mut self.offer, other.offer);
        text(&mut self.sku, other.sku);
        text(&mut self.tag, other.tag);
        text(&mut self.url, other.url);
    }
}

impl Merge for EngineConfig {
    fn merge_from(&mut self, other: Self) {
        text(&mut self.kind, other.kind);
        text(&mut self.version, other.version);
        scalar(&mut self.cpus, other.cpus);
        scalar(&mut self.memory_mb, other.memory_mb);
        scalar(&mut self.disk_size_mb, other.disk_size_mb);
        scalar(&mut self.headless, other.headless);
        value_map(&mut self.options, other.options);
    }
}

impl Merge for ProvisioningSpec {
    fn merge_from(&mut self, other: Self) {
        list(&mut self.packages, other.packages);
        list(&mut self.commands, other.commands);
        string_map(&mut self.files, other.files);
        string_map(&mut self.environment, other.environment);
        text(&mut self.hostname, other.hostname);
        list(&mut self.tags, other.tags);
    }
}

impl Merge for BuildConfig {
    fn merge_from(&mut self, other: Self) {
        self.input.merge_from(other.input);
        list(&mut self.output, other.output);
        self.engine.merge_from(other.engine);
        if !other.distro.is_empty() {
            self.distro = other.distro;
        }
        self.provisioning.merge_from(other.provisioning);
        value_map(&mut self.variables, other.variables);
        text(&mut self.output_dir, other.output_dir);
    }
}
