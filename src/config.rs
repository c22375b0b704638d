//! Preflight configuration.
//!
//! Every host input the probes read can be redirected here, which is what
//! makes the checks testable against synthetic host trees.  A config file
//! looks like:
//!
//! ```toml
//! storage_driver = "overlay"
//! mount_test = true
//! userns_probe_timeout_ms = 2000
//!
//! [paths]
//! setuid_search_dirs = ["/usr/bin", "/usr/sbin"]
//! mount_test_base = "/var/tmp"
//! ```
//!
//! Every field is optional.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer};

use crate::{
    environment::{Environment, CONTAINER_MARKERS},
    error::{PreflightError, Result},
    identity::ETC_PASSWD,
    procfs::{MAX_USER_NAMESPACES, PROC_SELF_STATUS},
    setuid::DEFAULT_SEARCH_DIRS,
    storage::StorageBackend,
    userns::{ETC_SUBGID, ETC_SUBUID},
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreflightConfig {
    /// The storage backend the build wants.
    #[serde(deserialize_with = "deserialize_backend")]
    pub storage_driver: StorageBackend,

    /// Run the live overlay mount test when overlay looks usable.
    pub mount_test: bool,

    /// Whether overlay also needs `CAP_DAC_OVERRIDE` and the `userxattr`
    /// mount option.  Unset means "only under an orchestrator".
    pub rootless_mount_semantics: Option<bool>,

    pub userns_probe_timeout_ms: u64,

    /// Run this instead of re-executing the current binary as the
    /// namespace probe.  Exit status zero counts as success.
    pub userns_probe_command: Option<Vec<String>>,

    /// A binary that calls [`crate::userns_helper::init_if_helper`] first
    /// thing, used for the namespace probe and the namespaced mount test.
    /// Unset means the running binary.
    pub helper: Option<PathBuf>,

    pub paths: HostPaths,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        PreflightConfig {
            storage_driver: StorageBackend::Overlay,
            mount_test: true,
            rootless_mount_semantics: None,
            userns_probe_timeout_ms: 5000,
            userns_probe_command: None,
            helper: None,
            paths: HostPaths::default(),
        }
    }
}

/// Locations of the host sources the probes read.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostPaths {
    pub proc_status: PathBuf,
    pub max_user_namespaces: PathBuf,
    pub subuid: PathBuf,
    pub subgid: PathBuf,
    pub passwd: PathBuf,
    pub setuid_search_dirs: Vec<PathBuf>,
    /// Where the overlay mount test creates its temporary tree.
    pub mount_test_base: PathBuf,
    pub container_markers: Vec<PathBuf>,
}

impl Default for HostPaths {
    fn default() -> Self {
        HostPaths {
            proc_status: PROC_SELF_STATUS.into(),
            max_user_namespaces: MAX_USER_NAMESPACES.into(),
            subuid: ETC_SUBUID.into(),
            subgid: ETC_SUBGID.into(),
            passwd: ETC_PASSWD.into(),
            setuid_search_dirs: DEFAULT_SEARCH_DIRS.iter().map(PathBuf::from).collect(),
            mount_test_base: std::env::temp_dir(),
            container_markers: CONTAINER_MARKERS.iter().map(PathBuf::from).collect(),
        }
    }
}

fn deserialize_backend<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<StorageBackend, D::Error> {
    String::deserialize(deserializer)?
        .parse()
        .map_err(serde::de::Error::custom)
}

impl PreflightConfig {
    /// Parses a TOML configuration.  `path` only names the source in errors.
    pub fn from_toml(path: impl AsRef<Path>, content: &str) -> Result<PreflightConfig> {
        toml::from_str(content).map_err(|e| PreflightError::config(path.as_ref(), e.message()))
    }

    /// Loads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<PreflightConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| PreflightError::config(path, e))?;
        PreflightConfig::from_toml(path, &content)
    }

    pub fn userns_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.userns_probe_timeout_ms)
    }

    /// Whether rootless mount semantics apply in `environment`.
    pub fn rootless_mount_semantics(&self, environment: Environment) -> bool {
        self.rootless_mount_semantics
            .unwrap_or(environment == Environment::Orchestrator)
    }
}
