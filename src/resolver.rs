//! Build mode resolution.
//!
//! [`resolve`] fuses the probe results into a [`BuildModeVerdict`]: can an
//! unprivileged build proceed, by which mechanism, and on which storage
//! backend.  It is a pure function of its [`ResolverInput`]; nothing is
//! remembered between runs.
//!
//! The rules depend on the [`Environment`]:
//!
//! - **Orchestrator**: running as root is refused outright.  Otherwise the
//!   baseline capabilities are required *and* privilege escalation must not
//!   be blocked by `no_new_privs`.
//! - **Container engine / standalone**: the baseline capabilities, or
//!   failing that the setuid `newuidmap`/`newgidmap` helpers as long as
//!   `no_new_privs` doesn't neuter them.
//!
//! A working user namespace is required everywhere.  Overlay storage needs
//! extra capabilities and a passing mount test; when those are missing the
//! verdict falls back to the next backend instead of blocking the build.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::{
    capabilities::{Capability, CapabilitySnapshot},
    environment::Environment,
    error::{ErrorKind, PreflightError, ProbeStep, Result},
    identity::Identity,
    setuid::SetuidBinaryStatus,
    storage::{StorageBackend, StorageDriverAvailability, StorageDriverValidator},
    userns::UserNamespaceStatus,
};

/// How the build obtains its id mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mechanism {
    Capabilities,
    SetuidBinaries,
    Unavailable,
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mechanism::Capabilities => "capabilities",
            Mechanism::SetuidBinaries => "setuid-binaries",
            Mechanism::Unavailable => "unavailable",
        })
    }
}

/// A prerequisite that is not met.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmetRequirement {
    /// Root is refused under an orchestrator.
    RootUnderOrchestrator,
    /// A baseline capability is missing and no fallback applies.
    MissingCapability(Capability),
    /// A capability only the overlay backend needs.
    OverlayCapability(Capability),
    /// `no_new_privs` is set, so setuid helpers can't gain privileges.
    NoNewPrivileges,
    /// `no_new_privs` could not be read on a path that needs no escalation.
    NoNewPrivilegesUnknown(PreflightError),
    /// A setuid helper binary was not found.
    HelperMissing(&'static str),
    /// A setuid helper binary exists but lacks the set-user-ID bit.
    HelperNotSetuid(&'static str),
    /// `max_user_namespaces` is zero.
    UserNamespacesDisabled,
    /// The live namespace probe failed.
    UserNamespaceProbe(PreflightError),
    /// The live overlay mount test failed.
    OverlayMountTest(PreflightError),
    /// The requested backend is not available.
    BackendUnavailable(StorageBackend),
    /// A host source could not be read.
    Configuration(PreflightError),
}

impl UnmetRequirement {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UnmetRequirement::Configuration(_) | UnmetRequirement::NoNewPrivilegesUnknown(_) => {
                ErrorKind::Configuration
            }
            UnmetRequirement::UserNamespaceProbe(_) | UnmetRequirement::OverlayMountTest(_) => {
                ErrorKind::ProbeExecution
            }
            _ => ErrorKind::CapabilityDenied,
        }
    }

    /// Whether this alone prevents the build.  Storage shortfalls only
    /// downgrade the backend.
    pub fn blocking(&self) -> bool {
        !matches!(
            self,
            UnmetRequirement::OverlayCapability(_)
                | UnmetRequirement::OverlayMountTest(_)
                | UnmetRequirement::BackendUnavailable(_)
                | UnmetRequirement::NoNewPrivilegesUnknown(_)
        )
    }

    /// Non-blocking entries that don't touch storage.
    pub fn advisory(&self) -> bool {
        matches!(self, UnmetRequirement::NoNewPrivilegesUnknown(_))
    }

    /// What an operator can do about it.
    pub fn remediation(&self) -> &'static str {
        match self {
            UnmetRequirement::RootUnderOrchestrator => {
                "run the pod with a non-root securityContext.runAsUser"
            }
            UnmetRequirement::MissingCapability(_) | UnmetRequirement::OverlayCapability(_) => {
                "grant the capability to the build container"
            }
            UnmetRequirement::NoNewPrivileges => concat!(
                "enable privilege escalation ",
                "(allowPrivilegeEscalation: true / drop --security-opt no-new-privileges)"
            ),
            UnmetRequirement::HelperMissing(_) => "install the uidmap (shadow-utils) package",
            UnmetRequirement::HelperNotSetuid(_) => "restore the set-user-ID bit (chmod u+s)",
            UnmetRequirement::UserNamespacesDisabled => {
                "enable user namespaces at the kernel level (sysctl user.max_user_namespaces)"
            }
            UnmetRequirement::UserNamespaceProbe(_) => {
                "allow unshare(CLONE_NEWUSER) in the seccomp/AppArmor profile"
            }
            UnmetRequirement::OverlayMountTest(_) => {
                "use a kernel and filesystem that permit rootless overlay mounts"
            }
            UnmetRequirement::BackendUnavailable(_) => "choose another storage driver",
            UnmetRequirement::Configuration(_) | UnmetRequirement::NoNewPrivilegesUnknown(_) => {
                "make the host source readable"
            }
        }
    }
}

impl fmt::Display for UnmetRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnmetRequirement::RootUnderOrchestrator => {
                f.write_str("root not supported under orchestrator")
            }
            UnmetRequirement::MissingCapability(cap) | UnmetRequirement::OverlayCapability(cap) => {
                write!(f, "{cap}")
            }
            UnmetRequirement::NoNewPrivileges => {
                f.write_str("no_new_privs is set: setuid binaries cannot gain privileges")
            }
            UnmetRequirement::HelperMissing(name) => write!(f, "{name} not found"),
            UnmetRequirement::HelperNotSetuid(name) => write!(f, "{name} is not set-user-ID"),
            UnmetRequirement::UserNamespacesDisabled => {
                f.write_str("user namespaces disabled (max_user_namespaces = 0)")
            }
            UnmetRequirement::UserNamespaceProbe(e) => write!(f, "user namespace creation: {e}"),
            UnmetRequirement::OverlayMountTest(e) => write!(f, "overlay mount test: {e}"),
            UnmetRequirement::BackendUnavailable(backend) => {
                write!(f, "storage driver {backend} unavailable")
            }
            UnmetRequirement::NoNewPrivilegesUnknown(e) => write!(f, "no_new_privs unknown: {e}"),
            UnmetRequirement::Configuration(e) => write!(f, "{e}"),
        }
    }
}

impl Serialize for UnmetRequirement {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("UnmetRequirement", 4)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("blocking", &self.blocking())?;
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("remediation", self.remediation())?;
        state.end()
    }
}

/// The outcome of a preflight run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildModeVerdict {
    pub mechanism: Mechanism,
    pub environment: Environment,
    /// The backend to build with; the requested one when blocked.
    pub backend: StorageBackend,
    /// Every unmet prerequisite, blocking or not.
    pub unmet: Vec<UnmetRequirement>,
}

impl BuildModeVerdict {
    pub fn proceed(&self) -> bool {
        self.mechanism != Mechanism::Unavailable
    }

    pub fn blocking(&self) -> impl Iterator<Item = &UnmetRequirement> {
        self.unmet.iter().filter(|u| u.blocking())
    }

    /// The `Display` strings of every unmet requirement.
    pub fn unmet_names(&self) -> Vec<String> {
        self.unmet.iter().map(ToString::to_string).collect()
    }
}

/// Everything the resolver decides on.
#[derive(Debug, Clone, Copy)]
pub struct ResolverInput<'a> {
    pub environment: Environment,
    pub identity: &'a Identity,
    pub capabilities: &'a Result<CapabilitySnapshot>,
    pub no_new_privs: &'a Result<bool>,
    pub setuid: &'a SetuidBinaryStatus,
    pub userns: &'a Result<UserNamespaceStatus>,
    pub storage: &'a StorageDriverAvailability,
    pub requested: StorageBackend,
    pub rootless_mount_semantics: bool,
}

/// Decides whether and how an unprivileged build can proceed.
pub fn resolve(input: &ResolverInput<'_>) -> BuildModeVerdict {
    let environment = input.environment;
    if environment == Environment::Orchestrator && input.identity.is_root() {
        return BuildModeVerdict {
            mechanism: Mechanism::Unavailable,
            environment,
            backend: input.requested,
            unmet: vec![UnmetRequirement::RootUnderOrchestrator],
        };
    }

    let mut unmet = vec![];

    let userns_ready = match input.userns {
        Ok(status) if !status.supported => {
            unmet.push(UnmetRequirement::UserNamespacesDisabled);
            false
        }
        Ok(status) if !status.can_create => {
            let error = status.probe_error.clone().unwrap_or_else(|| {
                PreflightError::probe(ProbeStep::Child, status.error.as_deref().unwrap_or("failed"))
            });
            unmet.push(UnmetRequirement::UserNamespaceProbe(error));
            false
        }
        Ok(_) => true,
        Err(e) => {
            unmet.push(UnmetRequirement::Configuration(e.clone()));
            false
        }
    };

    // unknown counts as blocked wherever escalation has to be confirmed
    let no_new_privs = input.no_new_privs.as_ref().ok().copied();
    let escalation_blocked = no_new_privs != Some(false);
    let mut escalation_needed = environment == Environment::Orchestrator;

    let capabilities = match input.capabilities {
        Ok(caps) => Some(*caps),
        Err(e) => {
            unmet.push(UnmetRequirement::Configuration(e.clone()));
            None
        }
    };

    let candidate = capabilities.and_then(|caps| {
        let missing = caps.missing();
        let caps_ok = missing.is_empty();
        let refuse = |unmet: &mut Vec<UnmetRequirement>| {
            unmet.extend(missing.iter().copied().map(UnmetRequirement::MissingCapability));
        };

        match environment {
            Environment::Orchestrator => {
                if caps_ok && !escalation_blocked {
                    return Some(Mechanism::Capabilities);
                }
                refuse(&mut unmet);
                if no_new_privs == Some(true) {
                    unmet.push(UnmetRequirement::NoNewPrivileges);
                }
                None
            }
            Environment::ContainerEngine | Environment::Standalone => {
                if caps_ok {
                    return Some(Mechanism::Capabilities);
                }
                if input.setuid.usable() {
                    escalation_needed = true;
                    if !escalation_blocked {
                        return Some(Mechanism::SetuidBinaries);
                    }
                }
                refuse(&mut unmet);
                if no_new_privs == Some(true) {
                    unmet.push(UnmetRequirement::NoNewPrivileges);
                }
                for helper in input.setuid.binaries() {
                    if !helper.present() {
                        unmet.push(UnmetRequirement::HelperMissing(helper.name));
                    } else if !helper.setuid {
                        unmet.push(UnmetRequirement::HelperNotSetuid(helper.name));
                    }
                }
                None
            }
        }
    });

    if let Err(e) = input.no_new_privs {
        unmet.push(if escalation_needed {
            UnmetRequirement::Configuration(e.clone())
        } else {
            UnmetRequirement::NoNewPrivilegesUnknown(e.clone())
        });
    }

    let mechanism = match candidate {
        Some(mechanism) if !unmet.iter().any(UnmetRequirement::blocking) => mechanism,
        _ => Mechanism::Unavailable,
    };

    let backend = if mechanism == Mechanism::Unavailable {
        input.requested
    } else {
        let validator =
            StorageDriverValidator::new(capabilities, userns_ready, input.rootless_mount_semantics);
        resolve_backend(input, &validator, &mut unmet)
    };

    BuildModeVerdict {
        mechanism,
        environment,
        backend,
        unmet,
    }
}

fn resolve_backend(
    input: &ResolverInput<'_>,
    validator: &StorageDriverValidator,
    unmet: &mut Vec<UnmetRequirement>,
) -> StorageBackend {
    let storage = input.storage;
    let requested = input.requested;

    if requested != StorageBackend::Overlay {
        if storage.is_available(requested) {
            return requested;
        }
        unmet.push(UnmetRequirement::BackendUnavailable(requested));
        return storage.fallback_for(requested);
    }

    let missing = validator.missing_capabilities(StorageBackend::Overlay);
    if !missing.is_empty() {
        unmet.extend(missing.into_iter().map(UnmetRequirement::OverlayCapability));
    } else if let Some(error) = storage
        .mount_test
        .as_ref()
        .and_then(|result| result.error.clone())
    {
        unmet.push(UnmetRequirement::OverlayMountTest(error));
    } else if !storage.overlay {
        unmet.push(UnmetRequirement::BackendUnavailable(StorageBackend::Overlay));
    } else {
        return StorageBackend::Overlay;
    }
    storage.fallback_for(StorageBackend::Overlay)
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{setuid::HelperBinary, storage::MountTestResult};

    const SETUID_SETGID: u64 = 0xc0;
    const FULL: u64 = SETUID_SETGID | 1 << 1 | 1 << 27;

    struct Fixture {
        environment: Environment,
        identity: Identity,
        capabilities: Result<CapabilitySnapshot>,
        no_new_privs: Result<bool>,
        setuid: SetuidBinaryStatus,
        userns: Result<UserNamespaceStatus>,
        storage: Option<StorageDriverAvailability>,
        requested: StorageBackend,
        strict: bool,
    }

    fn helper(name: &'static str, present: bool, setuid: bool) -> HelperBinary {
        HelperBinary {
            name,
            path: present.then(|| PathBuf::from("/usr/bin").join(name)),
            setuid,
        }
    }

    fn ready_userns() -> UserNamespaceStatus {
        UserNamespaceStatus {
            supported: true,
            max_namespaces: 63498,
            subuid: None,
            subgid: None,
            can_create: true,
            error: None,
            probe_error: None,
        }
    }

    impl Fixture {
        fn new(mask: u64) -> Fixture {
            Fixture {
                environment: Environment::Standalone,
                identity: Identity::new(1000, 1000, Some("builder")),
                capabilities: Ok(CapabilitySnapshot::from_mask(mask)),
                no_new_privs: Ok(false),
                setuid: SetuidBinaryStatus {
                    newuidmap: helper("newuidmap", false, false),
                    newgidmap: helper("newgidmap", false, false),
                },
                userns: Ok(ready_userns()),
                storage: None,
                requested: StorageBackend::Vfs,
                strict: false,
            }
        }

        fn setuid_helpers(mut self) -> Fixture {
            self.setuid = SetuidBinaryStatus {
                newuidmap: helper("newuidmap", true, true),
                newgidmap: helper("newgidmap", true, true),
            };
            self
        }

        fn resolve(&self) -> BuildModeVerdict {
            let userns_ready = self.userns.as_ref().is_ok_and(UserNamespaceStatus::ready);
            let storage = self.storage.clone().unwrap_or_else(|| {
                StorageDriverValidator::new(
                    self.capabilities.as_ref().ok().copied(),
                    userns_ready,
                    self.strict,
                )
                .availability()
            });
            resolve(&ResolverInput {
                environment: self.environment,
                identity: &self.identity,
                capabilities: &self.capabilities,
                no_new_privs: &self.no_new_privs,
                setuid: &self.setuid,
                userns: &self.userns,
                storage: &storage,
                requested: self.requested,
                rootless_mount_semantics: self.strict,
            })
        }
    }

    #[test]
    fn test_capabilities_with_vfs() {
        let verdict = Fixture::new(SETUID_SETGID).resolve();
        assert_eq!(
            verdict,
            BuildModeVerdict {
                mechanism: Mechanism::Capabilities,
                environment: Environment::Standalone,
                backend: StorageBackend::Vfs,
                unmet: vec![],
            }
        );
        assert!(verdict.proceed());
    }

    #[test]
    fn test_root_under_orchestrator() {
        for mask in [0, FULL, u64::MAX] {
            let mut fixture = Fixture::new(mask).setuid_helpers();
            fixture.environment = Environment::Orchestrator;
            fixture.identity = Identity::new(0, 0, Some("root"));
            fixture.userns = Err(PreflightError::config("/proc/sys/user/max_user_namespaces", "x"));
            let verdict = fixture.resolve();
            assert!(!verdict.proceed());
            assert_eq!(verdict.unmet_names(), vec!["root not supported under orchestrator"]);
        }
    }

    #[test]
    fn test_setuid_fallback() {
        let verdict = Fixture::new(0).setuid_helpers().resolve();
        assert_eq!(verdict.mechanism, Mechanism::SetuidBinaries);
        assert!(verdict.unmet.is_empty());
        assert!(verdict.proceed());
    }

    #[test]
    fn test_overlay_without_mknod_falls_back() {
        let mut fixture = Fixture::new(SETUID_SETGID | 1 << 1);
        fixture.requested = StorageBackend::Overlay;
        let verdict = fixture.resolve();
        assert!(verdict.proceed());
        assert_eq!(verdict.mechanism, Mechanism::Capabilities);
        assert_eq!(verdict.unmet_names(), vec!["CAP_MKNOD"]);
        assert_eq!(verdict.backend, StorageBackend::Native);
        assert_eq!(verdict.blocking().count(), 0);
    }

    #[test]
    fn test_userns_disabled_always_blocks() {
        for mask in [0, SETUID_SETGID, FULL, u64::MAX] {
            for environment in [
                Environment::Standalone,
                Environment::ContainerEngine,
                Environment::Orchestrator,
            ] {
                let mut fixture = Fixture::new(mask).setuid_helpers();
                fixture.environment = environment;
                fixture.userns = Ok(UserNamespaceStatus {
                    supported: false,
                    max_namespaces: 0,
                    can_create: false,
                    ..ready_userns()
                });
                let verdict = fixture.resolve();
                assert_eq!(verdict.mechanism, Mechanism::Unavailable);
                assert!(verdict
                    .unmet
                    .contains(&UnmetRequirement::UserNamespacesDisabled));
            }
        }
    }

    #[test]
    fn test_no_new_privs_disables_setuid() {
        for environment in [
            Environment::Standalone,
            Environment::ContainerEngine,
            Environment::Orchestrator,
        ] {
            for mask in [0, 1 << 7, 1 << 6] {
                let mut fixture = Fixture::new(mask).setuid_helpers();
                fixture.environment = environment;
                fixture.no_new_privs = Ok(true);
                let verdict = fixture.resolve();
                assert_ne!(verdict.mechanism, Mechanism::SetuidBinaries);
                assert!(verdict.unmet.contains(&UnmetRequirement::NoNewPrivileges));
            }
        }
    }

    #[test]
    fn test_orchestrator_requires_escalation() {
        let mut fixture = Fixture::new(FULL);
        fixture.environment = Environment::Orchestrator;
        assert_eq!(fixture.resolve().mechanism, Mechanism::Capabilities);

        fixture.no_new_privs = Ok(true);
        let verdict = fixture.resolve();
        assert_eq!(verdict.mechanism, Mechanism::Unavailable);
        assert_eq!(verdict.unmet, vec![UnmetRequirement::NoNewPrivileges]);

        // setuid helpers don't help under an orchestrator
        let mut fixture = Fixture::new(0).setuid_helpers();
        fixture.environment = Environment::Orchestrator;
        let verdict = fixture.resolve();
        assert_eq!(verdict.mechanism, Mechanism::Unavailable);
        assert_eq!(verdict.unmet_names(), vec!["CAP_SETUID", "CAP_SETGID"]);
    }

    #[test]
    fn test_every_missing_prerequisite_listed() {
        let mut fixture = Fixture::new(0);
        fixture.setuid.newuidmap = helper("newuidmap", true, false);
        let verdict = fixture.resolve();
        assert_eq!(
            verdict.unmet,
            vec![
                UnmetRequirement::MissingCapability(Capability::SETUID),
                UnmetRequirement::MissingCapability(Capability::SETGID),
                UnmetRequirement::HelperNotSetuid("newuidmap"),
                UnmetRequirement::HelperMissing("newgidmap"),
            ]
        );
        assert!(verdict.unmet.iter().all(UnmetRequirement::blocking));
    }

    #[test]
    fn test_unreadable_capabilities_block() {
        let mut fixture = Fixture::new(0).setuid_helpers();
        fixture.capabilities = Err(PreflightError::config("/proc/self/status", "no CapEff field"));
        let verdict = fixture.resolve();
        assert_eq!(verdict.mechanism, Mechanism::Unavailable);
        assert_eq!(verdict.unmet.len(), 1);
        assert_eq!(verdict.unmet[0].kind(), ErrorKind::Configuration);
    }

    fn unknown_no_new_privs() -> Result<bool> {
        Err(PreflightError::config("/proc/self/status", "no NoNewPrivs field"))
    }

    #[test]
    fn test_unknown_no_new_privs_with_capabilities() {
        for environment in [Environment::Standalone, Environment::ContainerEngine] {
            let mut fixture = Fixture::new(SETUID_SETGID).setuid_helpers();
            fixture.environment = environment;
            fixture.no_new_privs = unknown_no_new_privs();
            let verdict = fixture.resolve();
            assert!(verdict.proceed());
            assert_eq!(verdict.mechanism, Mechanism::Capabilities);
            assert_eq!(verdict.unmet.len(), 1);
            assert_eq!(verdict.unmet[0].kind(), ErrorKind::Configuration);
            assert!(!verdict.unmet[0].blocking());
            assert!(verdict.unmet[0].advisory());
        }
    }

    #[test]
    fn test_unknown_no_new_privs_with_setuid_helpers() {
        // the helpers need escalation, and it can't be confirmed
        let mut fixture = Fixture::new(0).setuid_helpers();
        fixture.no_new_privs = unknown_no_new_privs();
        let verdict = fixture.resolve();
        assert_eq!(verdict.mechanism, Mechanism::Unavailable);
        assert!(verdict
            .unmet
            .iter()
            .any(|u| u.kind() == ErrorKind::Configuration && u.blocking()));
    }

    #[test]
    fn test_unknown_no_new_privs_under_orchestrator() {
        let mut fixture = Fixture::new(FULL);
        fixture.environment = Environment::Orchestrator;
        fixture.no_new_privs = unknown_no_new_privs();
        let verdict = fixture.resolve();
        assert_eq!(verdict.mechanism, Mechanism::Unavailable);
        assert_eq!(
            verdict.unmet,
            vec![UnmetRequirement::Configuration(
                PreflightError::config("/proc/self/status", "no NoNewPrivs field")
            )]
        );
    }

    #[test]
    fn test_userns_probe_failure_kind() {
        let mut fixture = Fixture::new(FULL);
        fixture.userns = Ok(UserNamespaceStatus {
            can_create: false,
            probe_error: Some(PreflightError::probe(
                ProbeStep::Child,
                "unshare(CLONE_NEWUSER): Operation not permitted",
            )),
            ..ready_userns()
        });
        let verdict = fixture.resolve();
        assert!(!verdict.proceed());
        assert_eq!(verdict.unmet.len(), 1);
        assert_eq!(verdict.unmet[0].kind(), ErrorKind::ProbeExecution);
        assert!(verdict.unmet[0].to_string().contains("Operation not permitted"));
    }

    #[test]
    fn test_overlay_strict_needs_dac_override() {
        let mut fixture = Fixture::new(SETUID_SETGID | 1 << 27);
        fixture.requested = StorageBackend::Overlay;
        assert_eq!(fixture.resolve().backend, StorageBackend::Overlay);

        fixture.strict = true;
        let verdict = fixture.resolve();
        assert_eq!(verdict.backend, StorageBackend::Native);
        assert_eq!(verdict.unmet_names(), vec!["CAP_DAC_OVERRIDE"]);
    }

    #[test]
    fn test_overlay_with_setuid_mechanism() {
        let mut fixture = Fixture::new(1 << 27).setuid_helpers();
        fixture.requested = StorageBackend::Overlay;
        let verdict = fixture.resolve();
        assert_eq!(verdict.mechanism, Mechanism::SetuidBinaries);
        assert_eq!(verdict.unmet_names(), vec!["CAP_SETUID", "CAP_SETGID"]);
        assert_eq!(verdict.backend, StorageBackend::Native);
    }

    #[test]
    fn test_failed_mount_test_falls_back() {
        let mut fixture = Fixture::new(FULL);
        fixture.requested = StorageBackend::Overlay;
        let error = PreflightError::probe(ProbeStep::Mount, "fsmount: Operation not permitted");
        fixture.storage = Some(
            StorageDriverValidator::new(Some(CapabilitySnapshot::from_mask(FULL)), true, false)
                .availability()
                .with_mount_test(MountTestResult {
                    success: false,
                    error: Some(error.clone()),
                    workdir: PathBuf::from("/tmp/overlay-probe-1"),
                    elapsed: Duration::from_millis(2),
                }),
        );
        let verdict = fixture.resolve();
        assert!(verdict.proceed());
        assert_eq!(verdict.backend, StorageBackend::Native);
        assert_eq!(verdict.unmet, vec![UnmetRequirement::OverlayMountTest(error)]);
        assert_eq!(verdict.unmet[0].kind(), ErrorKind::ProbeExecution);
    }

    #[test]
    fn test_blocked_reports_requested_backend() {
        let mut fixture = Fixture::new(0);
        fixture.requested = StorageBackend::Overlay;
        let verdict = fixture.resolve();
        assert!(!verdict.proceed());
        assert_eq!(verdict.backend, StorageBackend::Overlay);
        // overlay shortfalls are not listed on top of the blocking ones
        assert!(verdict.unmet.iter().all(UnmetRequirement::blocking));
    }

    #[test]
    fn test_native_unavailable_falls_back_to_vfs() {
        let mut fixture = Fixture::new(SETUID_SETGID);
        fixture.requested = StorageBackend::Native;
        fixture.storage = Some(StorageDriverAvailability {
            vfs: true,
            native: false,
            overlay: false,
            mount_test: None,
        });
        let verdict = fixture.resolve();
        assert!(verdict.proceed());
        assert_eq!(verdict.backend, StorageBackend::Vfs);
        assert_eq!(
            verdict.unmet,
            vec![UnmetRequirement::BackendUnavailable(StorageBackend::Native)]
        );
    }

    #[test]
    fn test_resolve_is_pure() {
        let mut fixture = Fixture::new(SETUID_SETGID | 1 << 1).setuid_helpers();
        fixture.requested = StorageBackend::Overlay;
        assert_eq!(fixture.resolve(), fixture.resolve());
    }
}
