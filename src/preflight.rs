//! A complete preflight run.
//!
//! [`Preflight::run`] performs every probe once, in a fixed order, and hands
//! the results to the resolver.  The probe results are kept in the
//! [`PreflightReport`] alongside the verdict so the reporter can explain it.

use std::{ffi::OsString, path::PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    capabilities::{Capability, CapabilitySnapshot},
    config::PreflightConfig,
    environment::{EnvSignals, Environment},
    error::Result,
    identity::Identity,
    mount::MountRunner,
    resolver::{resolve, BuildModeVerdict, ResolverInput},
    setuid::{SetuidBinaryInspector, SetuidBinaryStatus},
    storage::{StorageBackend, StorageDriverAvailability, StorageDriverValidator},
    userns::{running_binary, ProbeCommand, UserNamespaceProber, UserNamespaceStatus},
};

/// Everything one run found out, plus the verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightReport {
    pub identity: Identity,
    pub environment: Environment,
    pub requested: StorageBackend,
    pub rootless_mount_semantics: bool,
    pub capabilities: Result<CapabilitySnapshot>,
    pub no_new_privs: Result<bool>,
    pub setuid: SetuidBinaryStatus,
    pub userns: Result<UserNamespaceStatus>,
    pub storage: StorageDriverAvailability,
    pub verdict: BuildModeVerdict,
}

impl PreflightReport {
    pub fn proceed(&self) -> bool {
        self.verdict.proceed()
    }
}

/// A configured preflight run.  Host inputs default to the live system and
/// can each be replaced.
#[derive(Debug, Clone)]
pub struct Preflight {
    config: PreflightConfig,
    identity: Option<Identity>,
    signals: Option<EnvSignals>,
}

impl Preflight {
    pub fn new(config: PreflightConfig) -> Preflight {
        Preflight {
            config,
            identity: None,
            signals: None,
        }
    }

    /// Run as `identity` instead of the current process' user.
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Use `signals` instead of the process environment and marker files.
    pub fn signals(mut self, signals: EnvSignals) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn config(&self) -> &PreflightConfig {
        &self.config
    }

    fn current_identity(&self) -> Identity {
        if let Some(identity) = &self.identity {
            return identity.clone();
        }
        Identity::current(&self.config.paths.passwd).unwrap_or_else(|e| {
            warn!("{e}");
            let uid = rustix::process::getuid().as_raw();
            let gid = rustix::process::getgid().as_raw();
            Identity::new(uid, gid, None)
        })
    }

    fn helper(&self) -> Result<PathBuf> {
        match &self.config.helper {
            Some(helper) => Ok(helper.clone()),
            None => running_binary(),
        }
    }

    fn probe_command(&self) -> ProbeCommand {
        if let Some(argv) = &self.config.userns_probe_command {
            return ProbeCommand::Command(argv.iter().map(OsString::from).collect());
        }
        match self.helper() {
            Ok(helper) => ProbeCommand::Helper(helper),
            Err(e) => {
                warn!("{e}; probing with unshare(1) instead");
                ProbeCommand::unshare()
            }
        }
    }

    /// Where to run the overlay mount test.  Without `CAP_SYS_ADMIN` the
    /// mount only works from inside a user namespace, like the build's own.
    fn mount_runner(&self, capabilities: &Result<CapabilitySnapshot>) -> MountRunner {
        if capabilities
            .as_ref()
            .is_ok_and(|caps| caps.has(Capability::SYS_ADMIN))
        {
            return MountRunner::InProcess;
        }
        match self.helper() {
            Ok(helper) => MountRunner::Namespace {
                helper,
                timeout: self.config.userns_probe_timeout(),
            },
            Err(e) => {
                warn!("{e}; mount test runs in this process");
                MountRunner::InProcess
            }
        }
    }

    /// Runs every probe and resolves the verdict.
    pub fn run(&self) -> PreflightReport {
        let config = &self.config;
        let paths = &config.paths;

        let identity = self.current_identity();
        let environment = Environment::detect(
            &self
                .signals
                .clone()
                .unwrap_or_else(|| EnvSignals::from_host(&paths.container_markers)),
        );
        let rootless_mount_semantics = config.rootless_mount_semantics(environment);
        info!(
            "preflight as uid {} in {environment} environment, requested storage {}",
            identity.uid, config.storage_driver
        );

        let capabilities = CapabilitySnapshot::read(&paths.proc_status);
        if let Err(e) = &capabilities {
            warn!("{e}");
        }

        let prober = UserNamespaceProber::new(identity.clone(), self.probe_command())
            .proc_status(&paths.proc_status)
            .max_user_namespaces(&paths.max_user_namespaces)
            .subid_files(&paths.subuid, &paths.subgid)
            .timeout(config.userns_probe_timeout());
        let no_new_privs = prober.no_new_privs();

        let setuid = SetuidBinaryInspector::new(paths.setuid_search_dirs.iter().cloned()).inspect();

        let userns = prober.probe();
        if let Err(e) = &userns {
            warn!("{e}");
        }
        let userns_ready = userns.as_ref().is_ok_and(UserNamespaceStatus::ready);

        let validator = StorageDriverValidator::new(
            capabilities.as_ref().ok().copied(),
            userns_ready,
            rootless_mount_semantics,
        );
        let storage = if config.mount_test && config.storage_driver == StorageBackend::Overlay {
            validator.verify(&paths.mount_test_base, self.mount_runner(&capabilities))
        } else {
            validator.availability()
        };
        debug!("storage: {storage:?}");

        let verdict = resolve(&ResolverInput {
            environment,
            identity: &identity,
            capabilities: &capabilities,
            no_new_privs: &no_new_privs,
            setuid: &setuid,
            userns: &userns,
            storage: &storage,
            requested: config.storage_driver,
            rootless_mount_semantics,
        });
        info!(
            "verdict: {} with {} ({} unmet)",
            verdict.mechanism,
            verdict.backend,
            verdict.unmet.len()
        );

        PreflightReport {
            identity,
            environment,
            requested: config.storage_driver,
            rootless_mount_semantics,
            capabilities,
            no_new_privs,
            setuid,
            userns,
            storage,
            verdict,
        }
    }
}
