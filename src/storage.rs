//! Storage backend availability.
//!
//! Three backends can back an image build:
//!
//! - `vfs`: plain copies of every layer.  Slow and large, but it needs no
//!   privileges at all, so it is always available.
//! - `native`: the build engine's own copy-on-write snapshotter.  It needs a
//!   working id mapping, either through the baseline capabilities or through
//!   a usable user namespace.
//! - `overlay`: kernel overlayfs.  Needs `CAP_SETUID`/`CAP_SETGID` plus
//!   `CAP_MKNOD` for whiteouts, and `CAP_DAC_OVERRIDE` as well where rootless
//!   mount semantics are enforced.
//!
//! Static availability only says what the permission bits allow.  The live
//! mount test in [`crate::mount`] checks whether the kernel really honours an
//! overlay mount here.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::Serialize;

use crate::{
    capabilities::{Capability, CapabilitySnapshot},
    error::{PreflightError, Result},
    mount::{MountRunner, OverlayMountTest},
};

/// A storage backend the build can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Vfs,
    Native,
    Overlay,
}

impl StorageBackend {
    pub const ALL: [StorageBackend; 3] = [
        StorageBackend::Vfs,
        StorageBackend::Native,
        StorageBackend::Overlay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Vfs => "vfs",
            StorageBackend::Native => "native",
            StorageBackend::Overlay => "overlay",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown backend name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown storage driver {0:?} (expected vfs, native or overlay)")]
pub struct UnknownBackend(pub String);

impl FromStr for StorageBackend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vfs" => Ok(StorageBackend::Vfs),
            "native" => Ok(StorageBackend::Native),
            "overlay" | "overlayfs" => Ok(StorageBackend::Overlay),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

/// Outcome of a live overlay mount test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountTestResult {
    pub success: bool,
    pub error: Option<PreflightError>,
    /// The temporary test root; it no longer exists once the test returns.
    pub workdir: PathBuf,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub elapsed: Duration,
}

fn serialize_duration_ms<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Which backends can be used, and the live overlay test if one was run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageDriverAvailability {
    pub vfs: bool,
    pub native: bool,
    pub overlay: bool,
    pub mount_test: Option<MountTestResult>,
}

impl StorageDriverAvailability {
    pub fn is_available(&self, backend: StorageBackend) -> bool {
        match backend {
            StorageBackend::Vfs => self.vfs,
            StorageBackend::Native => self.native,
            StorageBackend::Overlay => self.overlay,
        }
    }

    /// Records a live mount test.  A failed test makes overlay unavailable
    /// regardless of what the permission bits said.
    pub fn with_mount_test(mut self, result: MountTestResult) -> StorageDriverAvailability {
        self.overlay &= result.success;
        self.mount_test = Some(result);
        self
    }

    /// The backend to report when `requested` can't be used: the most
    /// capable available backend below it.
    pub fn fallback_for(&self, requested: StorageBackend) -> StorageBackend {
        match requested {
            StorageBackend::Overlay if self.native => StorageBackend::Native,
            _ => StorageBackend::Vfs,
        }
    }
}

/// Derives backend availability from capability and namespace state.
///
/// Availability is a function of its inputs: whenever the capability
/// snapshot or namespace readiness changes, build a new validator.
#[derive(Debug, Clone)]
pub struct StorageDriverValidator {
    capabilities: Option<CapabilitySnapshot>,
    userns_ready: bool,
    rootless_mount_semantics: bool,
}

impl StorageDriverValidator {
    /// `capabilities` is `None` when the capability state could not be read;
    /// nothing beyond `vfs` is then considered available.
    pub fn new(
        capabilities: Option<CapabilitySnapshot>,
        userns_ready: bool,
        rootless_mount_semantics: bool,
    ) -> StorageDriverValidator {
        StorageDriverValidator {
            capabilities,
            userns_ready,
            rootless_mount_semantics,
        }
    }

    /// Every capability the given backend needs in this environment.
    pub fn required_capabilities(&self, backend: StorageBackend) -> Vec<Capability> {
        let mut required = Capability::BASELINE.to_vec();
        if backend == StorageBackend::Overlay {
            required.push(Capability::MKNOD);
            if self.rootless_mount_semantics {
                required.push(Capability::DAC_OVERRIDE);
            }
        }
        required
    }

    /// Capabilities the given backend needs that are not held.  Without a
    /// capability snapshot, everything required counts as missing.
    pub fn missing_capabilities(&self, backend: StorageBackend) -> Vec<Capability> {
        let Some(caps) = &self.capabilities else {
            return self.required_capabilities(backend);
        };
        let mut missing = caps.missing_for_storage(backend);
        if backend == StorageBackend::Overlay
            && self.rootless_mount_semantics
            && !caps.has(Capability::DAC_OVERRIDE)
        {
            missing.push(Capability::DAC_OVERRIDE);
        }
        missing
    }

    /// Fails with [`PreflightError::CapabilityDenied`] if `backend` can't be
    /// used with the current capabilities.
    pub fn require(&self, backend: StorageBackend) -> Result<()> {
        match self.capabilities {
            Some(caps) => caps.require(&self.required_capabilities(backend)),
            None => Err(PreflightError::CapabilityDenied {
                missing: self
                    .required_capabilities(backend)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            }),
        }
    }

    /// Static availability of each backend.
    pub fn availability(&self) -> StorageDriverAvailability {
        let baseline = self
            .capabilities
            .is_some_and(|caps| caps.missing().is_empty());
        StorageDriverAvailability {
            vfs: true,
            native: baseline || self.userns_ready,
            overlay: self.require(StorageBackend::Overlay).is_ok(),
            mount_test: None,
        }
    }

    /// Static availability, followed by a live overlay mount test under
    /// `base` when overlay looks usable.
    pub fn verify(
        &self,
        base: impl Into<PathBuf>,
        runner: MountRunner,
    ) -> StorageDriverAvailability {
        let availability = self.availability();
        if !availability.overlay {
            return availability;
        }
        let result = OverlayMountTest::new(base)
            .userxattr(self.rootless_mount_semantics)
            .runner(runner)
            .run();
        availability.with_mount_test(result)
    }
}
