//! Build-result manifest written by packer's `manifest` post-processor.
//!
//! Used to recover the realized image's identity after an engine run.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::image::{AmiImage, DiskImage, GceImage, Image};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub builds: Vec<ManifestBuild>,
    #[serde(default)]
    pub last_run_uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestBuild {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub builder_type: String,
    /// Unix timestamp of when the build finished.
    #[serde(default)]
    pub build_time: i64,
    #[serde(default)]
    pub files: Option<Vec<ManifestFile>>,
    #[serde(default)]
    pub artifact_id: String,
    #[serde(default)]
    pub packer_run_uuid: String,
    #[serde(default)]
    pub custom_data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("reading manifest '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing manifest '{}'", path.display()))
    }

    /// Builds of the last run, newest first, followed by older ones.
    fn builds_by_recency(&self) -> Vec<&ManifestBuild> {
        let in_last_run = |b: &&ManifestBuild| {
            !self.last_run_uuid.is_empty() && b.packer_run_uuid == self.last_run_uuid
        };
        let (mut latest, mut older): (Vec<_>, Vec<_>) = self.builds.iter().partition(in_last_run);
        latest.reverse();
        older.reverse();
        latest.extend(older);
        latest
    }

    /// The image produced by the most recent recognised build.
    pub fn image(&self) -> Result<Image> {
        for build in self.builds_by_recency() {
            if let Some(image) = image_from_build(build)? {
                return Ok(image);
            }
        }
        bail!(
            "cannot find a supported image in manifest (builders: {})",
            self.builds
                .iter()
                .map(|b| b.builder_type.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

fn image_from_build(build: &ManifestBuild) -> Result<Option<Image>> {
    let image = match build.builder_type.as_str() {
        "amazon-ebs" => {
            // Multi-region builds list "region:id" pairs separated by commas.
            let first = build.artifact_id.split(',').next().unwrap_or_default();
            let Some((region, id)) = first.split_once(':') else {
                bail!(
                    "malformed artifact id '{}' for build '{}', expected region:id",
                    build.artifact_id,
                    build.name
                );
            };
            if region.is_empty() || id.is_empty() {
                bail!(
                    "malformed artifact id '{}' for build '{}', expected region:id",
                    build.artifact_id,
                    build.name
                );
            }
            Image::Ami(AmiImage {
                region: Some(region.to_string()),
                id: Some(id.to_string()),
            })
        }
        "qemu" => {
            let file = build
                .files
                .as_deref()
                .and_then(|files| files.first())
                .with_context(|| format!("qemu build '{}' produced no files", build.name))?;
            let format = Path::new(&file.name)
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("qcow2")
                .to_string();
            Image::Qemu(DiskImage {
                path: Some(file.name.clone()),
                format: Some(format),
                checksum: None,
            })
        }
        "googlecompute" => {
            let project = build
                .custom_data
                .as_ref()
                .and_then(|data| data.get("project"))
                .and_then(Value::as_str)
                .with_context(|| {
                    format!(
                        "googlecompute build '{}' has no custom_data.project",
                        build.name
                    )
                })?;
            if build.artifact_id.is_empty() {
                bail!("googlecompute build '{}' has no artifact id", build.name);
            }
            Image::Gce(GceImage {
                project: Some(project.to_string()),
                image: Some(build.artifact_id.clone()),
                bucket: None,
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
      "builds": [
        {"name": "old", "builder_type": "amazon-ebs", "build_time": 1580000000,
         "files": null, "artifact_id": "us-east-1:ami-old", "packer_run_uuid": "run-1"},
        {"name": "aws", "builder_type": "amazon-ebs", "build_time": 1590000000,
         "files": null, "artifact_id": "eu-west-1:ami-0abc", "packer_run_uuid": "run-2"}
      ],
      "last_run_uuid": "run-2"
    }"#;

    #[test]
    fn prefers_last_run() {
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        assert_eq!(manifest.image().unwrap().to_string(), "eu-west-1:ami-0abc");
    }

    #[test]
    fn load_from_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json");
        fs::write(&path, MANIFEST).unwrap();
        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.builds.len(), 2);
        assert_eq!(manifest.builds[1].build_time, 1590000000);
        assert!(Manifest::load(&tmp.path().join("missing.json")).is_err());
    }

    #[test]
    fn malformed_ami_id_is_an_error() {
        let manifest = Manifest {
            builds: vec![ManifestBuild {
                name: "aws".into(),
                builder_type: "amazon-ebs".into(),
                artifact_id: "ami-without-region".into(),
                ..Default::default()
            }],
            last_run_uuid: String::new(),
        };
        let err = manifest.image().unwrap_err();
        assert!(err.to_string().contains("region:id"));
    }

    #[test]
    fn qemu_and_gce_builds() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"builds": [{"name": "q", "builder_type": "qemu",
                 "files": [{"name": "output/disk.raw", "size": 10}], "artifact_id": "VM"}]}"#,
        )
        .unwrap();
        let image = manifest.image().unwrap();
        assert_eq!(image.to_string(), "output/disk.raw");
        assert!(matches!(image, Image::Qemu(ref d) if d.format.as_deref() == Some("raw")));

        let manifest: Manifest = serde_json::from_str(
            r#"{"builds": [{"name": "g", "builder_type": "googlecompute",
                 "artifact_id": "img-1", "custom_data": {"project": "proj"}}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.image().unwrap().to_string(), "proj/img-1");
    }

    #[test]
    fn unknown_builders_only() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"builds": [{"name": "d", "builder_type": "docker", "artifact_id": "sha256:1"}]}"#,
        )
        .unwrap();
        let err = manifest.image().unwrap_err();
        assert!(err.to_string().contains("docker"));
    }
}
