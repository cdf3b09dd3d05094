//! Polymorphic image model.
//!
//! An [`Image`] is one of seven kinds, each holding its own identity fields.
//! Values read from config or distro templates may be partial; engines and
//! converters call [`Image::require_complete`] before touching anything
//! external, so a partially populated image never reaches a tool.

mod kind;

pub use kind::ImageKind;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{BuildError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AmiImage {
    pub region: Option<String>,
    pub id: Option<String>,
}

/// Qemu disk image. `path` may be a local path or a URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiskImage {
    pub path: Option<String>,
    pub format: Option<String>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GceImage {
    pub project: Option<String>,
    pub image: Option<String>,
    /// Staging bucket used when importing a disk.
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AzureImage {
    pub publisher: Option<String>,
    pub offer: Option<String>,
    pub sku: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerImage {
    pub image: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsoImage {
    pub url: Option<String>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OvaImage {
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Image {
    Ami(AmiImage),
    Qemu(DiskImage),
    Gce(GceImage),
    Azure(AzureImage),
    Docker(DockerImage),
    Iso(IsoImage),
    Ova(OvaImage),
}

/// Image as written in a config document: a kind plus any identity fields.
///
/// The struct is flat so overrides like `input.region=us-west-2` map onto a
/// typed field regardless of the kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageDescriptor {
    #[serde(skip_serializing_if = "is_unset")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub publisher: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub offer: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub sku: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub url: Option<String>,
}

pub(crate) fn is_unset(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}

fn present(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

fn fill(field: &mut Option<String>, template: &Option<String>) {
    if is_unset(field) {
        *field = present(template);
    }
}

impl ImageDescriptor {
    /// Names of the fields that are set, in declaration order.
    fn set_fields(&self) -> Vec<&'static str> {
        [
            ("region", &self.region),
            ("id", &self.id),
            ("path", &self.path),
            ("format", &self.format),
            ("checksum", &self.checksum),
            ("project", &self.project),
            ("image", &self.image),
            ("bucket", &self.bucket),
            ("publisher", &self.publisher),
            ("offer", &self.offer),
            ("sku", &self.sku),
            ("tag", &self.tag),
            ("url", &self.url),
        ]
        .into_iter()
        .filter(|(_, value)| !is_unset(value))
        .map(|(name, _)| name)
        .collect()
    }
}

impl Image {
    /// An image of `kind` with every field unset.
    pub fn empty(kind: ImageKind) -> Image {
        match kind {
            ImageKind::Ami => Image::Ami(AmiImage::default()),
            ImageKind::Qemu => Image::Qemu(DiskImage::default()),
            ImageKind::Gce => Image::Gce(GceImage::default()),
            ImageKind::Azure => Image::Azure(AzureImage::default()),
            ImageKind::Docker => Image::Docker(DockerImage::default()),
            ImageKind::Iso => Image::Iso(IsoImage::default()),
            ImageKind::Ova => Image::Ova(OvaImage::default()),
        }
    }

    /// Build an image from its config form. Fields that mean nothing for the
    /// chosen kind are ignored with a warning.
    pub fn from_descriptor(descriptor: &ImageDescriptor) -> Result<Image> {
        let kind_name = present(&descriptor.kind)
            .ok_or_else(|| BuildError::invalid_config("image descriptor is missing 'kind'"))?;
        let kind = ImageKind::parse(&kind_name)?;

        let d = descriptor;
        let image = match kind {
            ImageKind::Ami => Image::Ami(AmiImage {
                region: present(&d.region),
                id: present(&d.id),
            }),
            ImageKind::Qemu => Image::Qemu(DiskImage {
                path: present(&d.path).or_else(|| present(&d.url)),
                format: present(&d.format),
                checksum: present(&d.checksum),
            }),
            ImageKind::Gce => Image::Gce(GceImage {
                project: present(&d.project),
                image: present(&d.image),
                bucket: present(&d.bucket),
            }),
            ImageKind::Azure => Image::Azure(AzureImage {
                publisher: present(&d.publisher),
                offer: present(&d.offer),
                sku: present(&d.sku),
            }),
            ImageKind::Docker => Image::Docker(DockerImage {
                image: present(&d.image),
                tag: present(&d.tag),
            }),
            ImageKind::Iso => Image::Iso(IsoImage {
                url: present(&d.url).or_else(|| present(&d.path)),
                checksum: present(&d.checksum),
            }),
            ImageKind::Ova => Image::Ova(OvaImage {
                path: present(&d.path),
            }),
        };

        let accepted = image.accepted_fields();
        let ignored: Vec<&str> = descriptor
            .set_fields()
            .into_iter()
            .filter(|field| !accepted.contains(field))
            .collect();
        if !ignored.is_empty() {
            warn!(
                "ignoring fields {:?} on {} image descriptor ('{}')",
                ignored, kind, kind_name
            );
        }

        Ok(image)
    }

    pub fn kind(&self) -> ImageKind {
        match self {
            Image::Ami(_) => ImageKind::Ami,
            Image::Qemu(_) => ImageKind::Qemu,
            Image::Gce(_) => ImageKind::Gce,
            Image::Azure(_) => ImageKind::Azure,
            Image::Docker(_) => ImageKind::Docker,
            Image::Iso(_) => ImageKind::Iso,
            Image::Ova(_) => ImageKind::Ova,
        }
    }

    /// Descriptor fields this kind reads (identity fields plus aliases and extras).
    fn accepted_fields(&self) -> &'static [&'static str] {
        match self {
            Image::Ami(_) => &["region", "id"],
            Image::Qemu(_) => &["path", "url", "format", "checksum"],
            Image::Gce(_) => &["project", "image", "bucket"],
            Image::Azure(_) => &["publisher", "offer", "sku"],
            Image::Docker(_) => &["image", "tag"],
            Image::Iso(_) => &["url", "path", "checksum"],
            Image::Ova(_) => &["path"],
        }
    }

    /// Identity fields with their current values.
    pub fn identity(&self) -> Vec<(&'static str, Option<&str>)> {
        fn v(field: &Option<String>) -> Option<&str> {
            field.as_deref().filter(|s| !s.is_empty())
        }
        match self {
            Image::Ami(i) => vec![("region", v(&i.region)), ("id", v(&i.id))],
            Image::Qemu(i) => vec![("path", v(&i.path)), ("format", v(&i.format))],
            Image::Gce(i) => vec![("project", v(&i.project)), ("image", v(&i.image))],
            Image::Azure(i) => vec![
                ("publisher", v(&i.publisher)),
                ("offer", v(&i.offer)),
                ("sku", v(&i.sku)),
            ],
            Image::Docker(i) => vec![("image", v(&i.image)), ("tag", v(&i.tag))],
            Image::Iso(i) => vec![("url", v(&i.url)), ("checksum", v(&i.checksum))],
            Image::Ova(i) => vec![("path", v(&i.path))],
        }
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        self.identity()
            .into_iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name)
            .collect()
    }

    /// No identity field is set.
    pub fn is_absent(&self) -> bool {
        self.identity().iter().all(|(_, value)| value.is_none())
    }

    pub fn require_complete(&self) -> Result<&Image> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            return Ok(self);
        }
        Err(BuildError::IncompleteImage {
            kind: self.kind().to_string(),
            missing,
        })
    }

    /// Fill unset fields from a distro template of the same kind.
    ///
    /// Fields already set on `self` are never touched, so applying the same
    /// template twice is the same as applying it once. Returns false when the
    /// template is of another kind and nothing was merged.
    pub fn merge_template(&mut self, template: &Image) -> bool {
        match (self, template) {
            (Image::Ami(a), Image::Ami(t)) => {
                fill(&mut a.region, &t.region);
                fill(&mut a.id, &t.id);
            }
            (Image::Qemu(a), Image::Qemu(t)) => {
                fill(&mut a.path, &t.path);
                fill(&mut a.format, &t.format);
                fill(&mut a.checksum, &t.checksum);
            }
            (Image::Gce(a), Image::Gce(t)) => {
                fill(&mut a.project, &t.project);
                fill(&mut a.image, &t.image);
                fill(&mut a.bucket, &t.bucket);
            }
            (Image::Azure(a), Image::Azure(t)) => {
                fill(&mut a.publisher, &t.publisher);
                fill(&mut a.offer, &t.offer);
                fill(&mut a.sku, &t.sku);
            }
            (Image::Docker(a), Image::Docker(t)) => {
                fill(&mut a.image, &t.image);
                fill(&mut a.tag, &t.tag);
            }
            (Image::Iso(a), Image::Iso(t)) => {
                fill(&mut a.url, &t.url);
                fill(&mut a.checksum, &t.checksum);
            }
            (Image::Ova(a), Image::Ova(t)) => {
                fill(&mut a.path, &t.path);
            }
            _ => return false,
        }
        true
    }

    /// Source options for a packer builder that starts from this image.
    pub fn builder_options(&self) -> BTreeMap<String, Value> {
        fn put(opts: &mut BTreeMap<String, Value>, key: &str, value: &Option<String>) {
            if let Some(value) = present(value) {
                opts.insert(key.to_string(), Value::String(value));
            }
        }

        let mut opts = BTreeMap::new();
        match self {
            Image::Ami(i) => {
                put(&mut opts, "source_ami", &i.id);
                put(&mut opts, "region", &i.region);
            }
            Image::Qemu(i) => {
                put(&mut opts, "iso_url", &i.path);
                put(&mut opts, "format", &i.format);
                if is_unset(&i.checksum) {
                    opts.insert("iso_checksum".to_string(), Value::from("none"));
                } else {
                    put(&mut opts, "iso_checksum", &i.checksum);
                }
                opts.insert("disk_image".to_string(), Value::Bool(true));
            }
            Image::Gce(i) => {
                put(&mut opts, "source_image", &i.image);
                put(&mut opts, "project_id", &i.project);
            }
            Image::Azure(i) => {
                put(&mut opts, "image_publisher", &i.publisher);
                put(&mut opts, "image_offer", &i.offer);
                put(&mut opts, "image_sku", &i.sku);
            }
            Image::Docker(i) => {
                if let (Some(image), Some(tag)) = (present(&i.image), present(&i.tag)) {
                    opts.insert("image".to_string(), Value::String(format!("{image}:{tag}")));
                }
            }
            Image::Iso(i) => {
                put(&mut opts, "iso_url", &i.url);
                put(&mut opts, "iso_checksum", &i.checksum);
            }
            Image::Ova(i) => {
                put(&mut opts, "source_path", &i.path);
            }
        }
        opts
    }
}

/// Canonical form, printed on stdout for scripts to capture.
impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn s(field: &Option<String>) -> &str {
            field.as_deref().unwrap_or("")
        }
        match self {
            Image::Ami(i) => write!(f, "{}:{}", s(&i.region), s(&i.id)),
            Image::Qemu(i) => f.write_str(s(&i.path)),
            Image::Gce(i) => write!(f, "{}/{}", s(&i.project), s(&i.image)),
            Image::Azure(i) => write!(f, "{}:{}:{}", s(&i.publisher), s(&i.offer), s(&i.sku)),
            Image::Docker(i) => write!(f, "{}:{}", s(&i.image), s(&i.tag)),
            Image::Iso(i) => f.write_str(s(&i.url)),
            Image::Ova(i) => f.write_str(s(&i.path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: &str) -> ImageDescriptor {
        ImageDescriptor {
            kind: Some(kind.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn descriptor_resolves_aliases() {
        let mut d = descriptor("aws");
        d.region = Some("eu-west-1".into());
        d.id = Some("ami-123".into());
        let image = Image::from_descriptor(&d).unwrap();
        assert_eq!(image.kind(), ImageKind::Ami);
        assert!(image.missing_fields().is_empty());
        assert_eq!(image.to_string(), "eu-west-1:ami-123");
    }

    #[test]
    fn descriptor_without_kind_is_config_error() {
        let err = Image::from_descriptor(&ImageDescriptor::default()).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Config);
    }

    #[test]
    fn empty_strings_count_as_unset() {
        let mut d = descriptor("qemu");
        d.path = Some(String::new());
        let image = Image::from_descriptor(&d).unwrap();
        assert!(image.is_absent());
        assert_eq!(image.missing_fields(), vec!["path", "format"]);
    }

    #[test]
    fn require_complete_names_missing_fields() {
        let image = Image::Ami(AmiImage {
            region: Some("us-east-1".into()),
            id: None,
        });
        let err = image.require_complete().unwrap_err();
        assert!(err.to_string().contains("id"));
        assert!(!image.is_absent());
    }

    #[test]
    fn template_merge_fills_gaps_only() {
        let mut input = Image::Qemu(DiskImage {
            path: Some("/images/base.img".into()),
            format: None,
            checksum: None,
        });
        let template = Image::Qemu(DiskImage {
            path: Some("https://example.org/cloud.img".into()),
            format: Some("qcow2".into()),
            checksum: Some("sha256:abcd".into()),
        });
        assert!(input.merge_template(&template));
        let once = input.clone();
        input.merge_template(&template);
        assert_eq!(input, once);
        match &input {
            Image::Qemu(disk) => {
                assert_eq!(disk.path.as_deref(), Some("/images/base.img"));
                assert_eq!(disk.format.as_deref(), Some("qcow2"));
            }
            other => panic!("unexpected image {other:?}"),
        }
    }

    #[test]
    fn template_of_other_kind_is_ignored() {
        let mut input = Image::empty(ImageKind::Docker);
        let template = Image::Ami(AmiImage {
            region: Some("us-east-1".into()),
            id: Some("ami-1".into()),
        });
        assert!(!input.merge_template(&template));
        assert!(input.is_absent());
    }

    #[test]
    fn builder_options_for_ami() {
        let image = Image::Ami(AmiImage {
            region: Some("us-east-1".into()),
            id: Some("ami-42".into()),
        });
        let opts = image.builder_options();
        assert_eq!(opts["source_ami"], Value::from("ami-42"));
        assert_eq!(opts["region"], Value::from("us-east-1"));
    }

    #[test]
    fn canonical_strings() {
        let docker = Image::Docker(DockerImage {
            image: Some("ubuntu".into()),
            tag: Some("18.04".into()),
        });
        assert_eq!(docker.to_string(), "ubuntu:18.04");
        let gce = Image::Gce(GceImage {
            project: Some("ubuntu-os-cloud".into()),
            image: Some("ubuntu-1804".into()),
            bucket: None,
        });
        assert_eq!(gce.to_string(), "ubuntu-os-cloud/ubuntu-1804");
    }
}
