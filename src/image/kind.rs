use std::fmt;

use crate::error::BuildError;

/// Tag identifying which image variant a value represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImageKind {
    Ami,
    Qemu,
    Gce,
    Azure,
    Docker,
    Iso,
    Ova,
}

/// Fixed alias table. Any name not listed here has no image kind.
const ALIASES: &[(&str, ImageKind)] = &[
    ("qemu", ImageKind::Qemu),
    ("img", ImageKind::Qemu),
    ("qcow2", ImageKind::Qemu),
    ("ova", ImageKind::Ova),
    ("vsphere", ImageKind::Ova),
    ("vm", ImageKind::Ova),
    ("ami", ImageKind::Ami),
    ("amazon-ebs", ImageKind::Ami),
    ("aws", ImageKind::Ami),
    ("azure", ImageKind::Azure),
    ("gce", ImageKind::Gce),
    ("docker", ImageKind::Docker),
    ("iso", ImageKind::Iso),
];

impl ImageKind {
    pub const ALL: [ImageKind; 7] = [
        ImageKind::Ami,
        ImageKind::Qemu,
        ImageKind::Gce,
        ImageKind::Azure,
        ImageKind::Docker,
        ImageKind::Iso,
        ImageKind::Ova,
    ];

    /// Resolve one of the accepted aliases (e.g. `qcow2`, `aws`, `vsphere`).
    pub fn from_alias(name: &str) -> Option<ImageKind> {
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map(|(_, kind)| *kind)
    }

    /// Like [`ImageKind::from_alias`] but fails with the list of accepted names.
    pub fn parse(name: &str) -> Result<ImageKind, BuildError> {
        Self::from_alias(name).ok_or_else(|| BuildError::UnknownImageKind {
            kind: name.to_string(),
            expected: ALIASES.iter().map(|(alias, _)| alias.to_string()).collect(),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Ami => "ami",
            ImageKind::Qemu => "qemu",
            ImageKind::Gce => "gce",
            ImageKind::Azure => "azure",
            ImageKind::Docker => "docker",
            ImageKind::Iso => "iso",
            ImageKind::Ova => "ova",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_table_is_fixed() {
        for alias in ["qemu", "img", "qcow2"] {
            assert_eq!(ImageKind::from_alias(alias), Some(ImageKind::Qemu));
        }
        for alias in ["ova", "vsphere", "vm"] {
            assert_eq!(ImageKind::from_alias(alias), Some(ImageKind::Ova));
        }
        for alias in ["ami", "amazon-ebs", "aws"] {
            assert_eq!(ImageKind::from_alias(alias), Some(ImageKind::Ami));
        }
        assert_eq!(ImageKind::from_alias("azure"), Some(ImageKind::Azure));
        assert_eq!(ImageKind::from_alias("gce"), Some(ImageKind::Gce));
        assert_eq!(ImageKind::from_alias("docker"), Some(ImageKind::Docker));
        assert_eq!(ImageKind::from_alias("iso"), Some(ImageKind::Iso));
    }

    #[test]
    fn unknown_alias_is_absent() {
        for alias in ["", "QEMU", "vpshere", "raw", "googlecompute"] {
            assert_eq!(ImageKind::from_alias(alias), None, "{alias}");
        }
        let err = ImageKind::parse("raw").unwrap_err();
        assert!(err.to_string().contains("qcow2"));
    }

    #[test]
    fn canonical_names_round_trip_through_aliases() {
        for kind in ImageKind::ALL {
            assert_eq!(ImageKind::from_alias(kind.as_str()), Some(kind));
        }
    }
}
