use std::fmt;

/// OS family a distribution belongs to, chosen from its `os` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Ubuntu,
    Debian,
    RedHat,
    /// Unrecognised OS. Provisioned with Ubuntu's hooks.
    Fallback,
}

const FAMILY_TABLE: &[(&str, OsFamily)] = &[
    ("ubuntu", OsFamily::Ubuntu),
    ("debian", OsFamily::Debian),
    ("centos", OsFamily::RedHat),
    ("redhat", OsFamily::RedHat),
    ("fedora", OsFamily::RedHat),
    ("amazonLinux", OsFamily::RedHat),
];

/// Package-manager hooks used when rendering the provisioning script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyHooks {
    /// Command prefix that installs packages given as trailing arguments.
    pub install: &'static str,
    /// Run once before the first install.
    pub pre_install: &'static [&'static str],
    /// Run after all provisioning commands.
    pub cleanup: &'static [&'static str],
}

const APT_HOOKS: FamilyHooks = FamilyHooks {
    install: "apt-get install -y -q",
    pre_install: &["export DEBIAN_FRONTEND=noninteractive", "apt-get update -q"],
    cleanup: &["apt-get clean", "rm -rf /var/lib/apt/lists/*"],
};

const APT_MINIMAL_HOOKS: FamilyHooks = FamilyHooks {
    install: "apt-get install -y -q --no-install-recommends",
    pre_install: &["export DEBIAN_FRONTEND=noninteractive", "apt-get update -q"],
    cleanup: &["apt-get clean", "rm -rf /var/lib/apt/lists/*"],
};

const YUM_HOOKS: FamilyHooks = FamilyHooks {
    install: "yum install -y",
    pre_install: &["yum makecache -q"],
    cleanup: &["yum clean all", "rm -rf /var/cache/yum"],
};

impl OsFamily {
    /// Map an OS identifier to its family. Unknown identifiers map to
    /// [`OsFamily::Fallback`]; the orchestrator logs that once per run.
    pub fn for_os(os: &str) -> OsFamily {
        FAMILY_TABLE
            .iter()
            .find(|(name, _)| *name == os)
            .map(|(_, family)| *family)
            .unwrap_or(OsFamily::Fallback)
    }

    pub fn hooks(&self) -> FamilyHooks {
        match self {
            OsFamily::Ubuntu | OsFamily::Fallback => APT_HOOKS,
            OsFamily::Debian => APT_MINIMAL_HOOKS,
            OsFamily::RedHat => YUM_HOOKS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Ubuntu => "ubuntu",
            OsFamily::Debian => "debian",
            OsFamily::RedHat => "redhat",
            OsFamily::Fallback => "fallback",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_table() {
        assert_eq!(OsFamily::for_os("ubuntu"), OsFamily::Ubuntu);
        assert_eq!(OsFamily::for_os("debian"), OsFamily::Debian);
        for os in ["centos", "redhat", "fedora", "amazonLinux"] {
            assert_eq!(OsFamily::for_os(os), OsFamily::RedHat, "{os}");
        }
    }

    #[test]
    fn unknown_os_falls_back_to_apt() {
        let family = OsFamily::for_os("slackware");
        assert_eq!(family, OsFamily::Fallback);
        assert_eq!(family.hooks(), OsFamily::Ubuntu.hooks());
    }
}
