//! Detection of the surrounding execution environment.
//!
//! The environment decides which rules the resolver applies, so detection
//! only looks at explicit [`EnvSignals`] gathered once at startup.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use log::debug;
use serde::Serialize;

/// Set by Kubernetes in every container it starts.
pub const ORCHESTRATOR_ENV: &str = "KUBERNETES_SERVICE_HOST";

/// Set by podman, systemd-nspawn and friends inside their containers.
pub const CONTAINER_ENV: &str = "container";

/// Files container engines leave in the root of their containers.
pub const CONTAINER_MARKERS: &[&str] = &["/run/.containerenv", "/.dockerenv"];

/// Where the preflight check is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    /// Directly on a host.
    Standalone,
    /// Inside a container started by docker, podman or similar.
    ContainerEngine,
    /// Inside a pod scheduled by an orchestrator.
    Orchestrator,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::Standalone => "standalone",
            Environment::ContainerEngine => "container-engine",
            Environment::Orchestrator => "orchestrator",
        })
    }
}

/// The raw signals environment detection is based on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSignals {
    pub vars: BTreeMap<String, String>,
    /// Container marker files that exist.
    pub markers: Vec<PathBuf>,
}

impl EnvSignals {
    /// Gathers signals from the current process environment and filesystem.
    pub fn from_host(markers: &[PathBuf]) -> EnvSignals {
        let vars = [ORCHESTRATOR_ENV, CONTAINER_ENV]
            .into_iter()
            .filter_map(|name| Some((name.to_string(), std::env::var(name).ok()?)))
            .collect();
        EnvSignals {
            vars,
            markers: markers.iter().filter(|p| p.exists()).cloned().collect(),
        }
    }

    pub fn var(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }

    pub fn marker(mut self, path: impl AsRef<Path>) -> Self {
        self.markers.push(path.as_ref().to_path_buf());
        self
    }

    fn is_set(&self, name: &str) -> bool {
        self.vars.get(name).is_some_and(|v| !v.trim().is_empty())
    }
}

impl Environment {
    /// The orchestrator signal takes precedence: pods run inside a container
    /// engine too, but the orchestrator's rules are the stricter ones.
    pub fn detect(signals: &EnvSignals) -> Environment {
        let environment = if signals.is_set(ORCHESTRATOR_ENV) {
            Environment::Orchestrator
        } else if signals.is_set(CONTAINER_ENV) || !signals.markers.is_empty() {
            Environment::ContainerEngine
        } else {
            Environment::Standalone
        };
        debug!("environment: {environment} from {signals:?}");
        environment
    }
}
