//! Effective capability inspection.
//!
//! The kernel exposes the effective capability set of a process as a 64-bit
//! hexadecimal mask on the `CapEff:` line of `/proc/<pid>/status`.  A
//! [`CapabilitySnapshot`] decodes that mask once; capabilities cannot
//! legitimately change inside a running unprivileged process, so re-checking
//! means taking a new snapshot.

use std::{fmt, path::Path};

use log::debug;
use rustix::thread::CapabilityFlags as CapabilitySet;
use serde::{ser::SerializeStruct, Serialize, Serializer};

use crate::{
    error::{PreflightError, Result},
    procfs::ProcStatus,
    storage::StorageBackend,
};

/// A single Linux capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability(CapabilitySet);

impl Capability {
    pub const DAC_OVERRIDE: Capability = Capability(CapabilitySet::DAC_OVERRIDE);
    pub const SETGID: Capability = Capability(CapabilitySet::SETGID);
    pub const SETUID: Capability = Capability(CapabilitySet::SETUID);
    pub const MKNOD: Capability = Capability(CapabilitySet::MKNOD);
    pub const SYS_ADMIN: Capability = Capability(CapabilitySet::SYS_ADMIN);

    /// Capabilities every rootless build needs to set up its id mappings.
    pub const BASELINE: [Capability; 2] = [Capability::SETUID, Capability::SETGID];

    /// Looks up a capability by name.
    ///
    /// Names are matched case-insensitively, with or without the `CAP_`
    /// prefix: `"SETUID"`, `"setuid"` and `"CAP_SETUID"` are all the same.
    pub fn from_name(name: &str) -> Option<Capability> {
        let upper = name.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("CAP_").unwrap_or(&upper);
        CapabilitySet::from_name(bare).map(Capability)
    }

    /// Every named capability.
    pub fn all() -> impl Iterator<Item = Capability> {
        CapabilitySet::all().iter().map(Capability)
    }

    pub fn mask(&self) -> u64 {
        self.0.bits()
    }

    /// The name without the `CAP_` prefix, e.g. `"MKNOD"`.
    pub fn name(&self) -> &'static str {
        self.0.iter_names().next().map_or("UNKNOWN", |(name, _)| name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CAP_{}", self.name())
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The decoded effective capability set of a process.  Read-only once taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    effective: CapabilitySet,
}

impl CapabilitySnapshot {
    /// Builds a snapshot from a raw effective-capability mask.  Bits the
    /// kernel may define later are kept.
    pub fn from_mask(effective: u64) -> CapabilitySnapshot {
        CapabilitySnapshot {
            effective: CapabilitySet::from_bits_retain(effective),
        }
    }

    /// Decodes the `CapEff` field of an already-parsed status file.
    pub fn from_status(status: &ProcStatus) -> Result<CapabilitySnapshot> {
        let effective = status.hex_field("CapEff")?;
        debug!("{}: CapEff {effective:016x}", status.path().display());
        Ok(CapabilitySnapshot::from_mask(effective))
    }

    /// Reads the effective capabilities from a process-status file, usually
    /// [`crate::procfs::PROC_SELF_STATUS`].
    pub fn read(status_path: impl AsRef<Path>) -> Result<CapabilitySnapshot> {
        CapabilitySnapshot::from_status(&ProcStatus::read(status_path)?)
    }

    pub fn effective(&self) -> u64 {
        self.effective.bits()
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.effective.contains(cap.0)
    }

    pub fn setuid(&self) -> bool {
        self.has(Capability::SETUID)
    }

    pub fn setgid(&self) -> bool {
        self.has(Capability::SETGID)
    }

    pub fn dac_override(&self) -> bool {
        self.has(Capability::DAC_OVERRIDE)
    }

    pub fn mknod(&self) -> bool {
        self.has(Capability::MKNOD)
    }

    /// Queries a capability by name.  Returns `None` for names that are not
    /// Linux capabilities at all.
    pub fn query(&self, name: &str) -> Option<bool> {
        Capability::from_name(name).map(|cap| self.has(cap))
    }

    /// Baseline capabilities for a rootless build that are not held.
    pub fn missing(&self) -> Vec<Capability> {
        Capability::BASELINE
            .into_iter()
            .filter(|cap| !self.has(*cap))
            .collect()
    }

    /// Capabilities missing for building with the given storage backend.
    ///
    /// This is always a superset of [`CapabilitySnapshot::missing`]; overlay
    /// additionally needs `CAP_MKNOD` to create whiteout devices.
    pub fn missing_for_storage(&self, backend: StorageBackend) -> Vec<Capability> {
        let mut missing = self.missing();
        if backend == StorageBackend::Overlay && !self.has(Capability::MKNOD) {
            missing.push(Capability::MKNOD);
        }
        missing
    }

    /// Fails with [`PreflightError::CapabilityDenied`] naming every
    /// capability in `required` that is not held.
    pub fn require(&self, required: &[Capability]) -> Result<()> {
        let missing: Vec<String> = required
            .iter()
            .filter(|cap| !self.has(**cap))
            .map(ToString::to_string)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PreflightError::CapabilityDenied { missing })
        }
    }
}

impl Serialize for CapabilitySnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CapabilitySnapshot", 5)?;
        state.serialize_field("effective", &self.effective())?;
        state.serialize_field("setuid", &self.setuid())?;
        state.serialize_field("setgid", &self.setgid())?;
        state.serialize_field("dac_override", &self.dac_override())?;
        state.serialize_field("mknod", &self.mknod())?;
        state.end()
    }
}
