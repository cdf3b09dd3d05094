//! Distribution profiles and the registry that loads them.
//!
//! Profiles live in the asset namespace under `distros/`. Each file maps
//! distro names to a [`Distribution`]. The registry reads them on first use
//! and keeps the result for the rest of the process.

mod family;

pub use family::{FamilyHooks, OsFamily};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::assets::{AssetSource, EmbeddedAssets, DISTROS_DIR};
use crate::error::{BuildError, Result};
use crate::image::{
    AmiImage, AzureImage, DiskImage, DockerImage, GceImage, Image, ImageKind, IsoImage, OvaImage,
};

/// A specific OS release plus the images each provider offers for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Distribution {
    pub os: String,
    pub family: String,
    pub distribution: String,
    pub distribution_release: String,
    pub distribution_version: String,
    pub ssh_username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ami: Option<AmiImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qemu: Option<DiskImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gce: Option<GceImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso: Option<IsoImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ova: Option<OvaImage>,
}

impl Distribution {
    /// Template image for `kind`, if this distro has one.
    pub fn template(&self, kind: ImageKind) -> Option<Image> {
        match kind {
            ImageKind::Ami => self.ami.clone().map(Image::Ami),
            ImageKind::Qemu => self.qemu.clone().map(Image::Qemu),
            ImageKind::Gce => self.gce.clone().map(Image::Gce),
            ImageKind::Azure => self.azure.clone().map(Image::Azure),
            ImageKind::Docker => self.docker.clone().map(Image::Docker),
            ImageKind::Iso => self.iso.clone().map(Image::Iso),
            ImageKind::Ova => self.ova.clone().map(Image::Ova),
        }
    }

    /// Template lookup by any kind alias. Unknown aliases yield `None`.
    pub fn image_by_kind(&self, alias: &str) -> Option<Image> {
        ImageKind::from_alias(alias).and_then(|kind| self.template(kind))
    }

    pub fn os_family(&self) -> OsFamily {
        OsFamily::for_os(&self.os)
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.os)
    }
}

/// Named distributions, loaded once from an asset source.
pub struct DistroRegistry {
    source: Box<dyn AssetSource>,
    cache: OnceLock<BTreeMap<String, Distribution>>,
}

impl fmt::Debug for DistroRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistroRegistry")
            .field("loaded", &self.cache.get().map(|d| d.len()))
            .finish()
    }
}

impl Default for DistroRegistry {
    fn default() -> Self {
        Self::new(Box::new(EmbeddedAssets))
    }
}

impl DistroRegistry {
    pub fn new(source: Box<dyn AssetSource>) -> Self {
        Self {
            source,
            cache: OnceLock::new(),
        }
    }

    /// All distributions. The first successful load is cached; a failed load
    /// is retried on the next call.
    pub fn distributions(&self) -> Result<&BTreeMap<String, Distribution>> {
        if let Some(loaded) = self.cache.get() {
            return Ok(loaded);
        }
        let loaded = self.load()?;
        Ok(self.cache.get_or_init(|| loaded))
    }

    /// Known distro names, sorted.
    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self.distributions()?.keys().cloned().collect())
    }

    pub fn resolve(&self, name: &str) -> Result<&Distribution> {
        let distros = self.distributions()?;
        distros.get(name).ok_or_else(|| BuildError::UnknownDistro {
            name: name.to_string(),
            known: distros.keys().cloned().collect(),
        })
    }

    fn load(&self) -> Result<BTreeMap<String, Distribution>> {
        let mut distros = BTreeMap::new();
        for file in self.source.list(DISTROS_DIR)? {
            let path = format!("{DISTROS_DIR}/{file}");
            let text = self.source.read_to_string(&path)?;
            let parsed: BTreeMap<String, Distribution> =
                toml::from_str(&text).map_err(|e| BuildError::Asset {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            trace!("{}: {} distributions", path, parsed.len());
            for (name, distro) in parsed {
                if distros.contains_key(&name) {
                    return Err(BuildError::Asset {
                        path,
                        reason: format!("distro '{name}' is defined more than once"),
                    });
                }
                distros.insert(name, distro);
            }
        }
        debug!(
            "loaded distributions: {:?}",
            distros.keys().collect::<Vec<_>>()
        );
        Ok(distros)
    }
}
