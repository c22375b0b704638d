//! Error types for the preflight probes.
//!
//! Every probe failure falls into one of three categories, and the
//! category is never collapsed: callers branch their remediation advice on
//! [`ErrorKind`].
//!
//! - **Configuration**: a host-introspection source (status file, kernel
//!   parameter, identity-range file) could not be read or parsed.
//! - **CapabilityDenied**: the probe ran and found a required permission
//!   absent.
//! - **ProbeExecution**: a live test (namespace creation or overlay mount)
//!   ran and failed at a named step.
//!
//! The variants carry owned strings rather than `std::io::Error` so that
//! snapshots holding them stay `Clone` and comparable.

use std::{fmt, path::PathBuf};

use serde::Serialize;

/// Result type alias for operations that may return a [`PreflightError`].
pub type Result<T> = std::result::Result<T, PreflightError>;

/// The step of a live probe that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeStep {
    /// Creating the lower/upper/work/merged tree for the mount test.
    CreateDirs,
    /// The overlay mount itself.
    Mount,
    /// Writing a marker file through the merged view.
    Write,
    /// Checking that the marker was copied up into the upper layer.
    VerifyUpper,
    /// Detaching the overlay again.
    Unmount,
    /// Starting the namespace probe child.
    Spawn,
    /// Waiting on the namespace probe child.
    Wait,
    /// The namespace probe child did not exit in time.
    Timeout,
    /// The namespace probe child exited unsuccessfully.
    Child,
}

impl ProbeStep {
    pub const ALL: [ProbeStep; 9] = [
        ProbeStep::CreateDirs,
        ProbeStep::Mount,
        ProbeStep::Write,
        ProbeStep::VerifyUpper,
        ProbeStep::Unmount,
        ProbeStep::Spawn,
        ProbeStep::Wait,
        ProbeStep::Timeout,
        ProbeStep::Child,
    ];

    /// The inverse of [`ProbeStep::as_str`].
    pub fn from_name(name: &str) -> Option<ProbeStep> {
        ProbeStep::ALL.into_iter().find(|step| step.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStep::CreateDirs => "create-dirs",
            ProbeStep::Mount => "mount",
            ProbeStep::Write => "write",
            ProbeStep::VerifyUpper => "verify-upper",
            ProbeStep::Unmount => "unmount",
            ProbeStep::Spawn => "spawn",
            ProbeStep::Wait => "wait",
            ProbeStep::Timeout => "timeout",
            ProbeStep::Child => "child",
        }
    }
}

impl fmt::Display for ProbeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse category of a [`PreflightError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Configuration,
    CapabilityDenied,
    ProbeExecution,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::CapabilityDenied => "capability-denied",
            ErrorKind::ProbeExecution => "probe-execution",
        })
    }
}

/// Error types for preflight probes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreflightError {
    /// A host-introspection source could not be read or parsed.
    #[error("cannot use {}: {reason}", path.display())]
    Configuration { path: PathBuf, reason: String },

    /// The probe completed and found required permissions missing.
    #[error("missing required capabilities: {}", missing.join(", "))]
    CapabilityDenied { missing: Vec<String> },

    /// A live probe ran and failed at a specific step.
    #[error("{step} step failed: {detail}")]
    ProbeExecution { step: ProbeStep, detail: String },
}

impl PreflightError {
    pub(crate) fn config(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        PreflightError::Configuration {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn probe(step: ProbeStep, detail: impl fmt::Display) -> Self {
        PreflightError::ProbeExecution {
            step,
            detail: detail.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PreflightError::Configuration { .. } => ErrorKind::Configuration,
            PreflightError::CapabilityDenied { .. } => ErrorKind::CapabilityDenied,
            PreflightError::ProbeExecution { .. } => ErrorKind::ProbeExecution,
        }
    }

    /// Recovers a step failure from its `Display` form, as a child process
    /// prints it on stderr.  Anything before the failing line is dropped.
    pub(crate) fn parse_step_failure(text: &str) -> Option<PreflightError> {
        let (head, detail) = text.split_once(" step failed: ")?;
        let name = head.rsplit('\n').next()?.trim();
        let step = ProbeStep::from_name(name)?;
        Some(PreflightError::probe(step, detail.trim()))
    }

    /// The failing step, for [`PreflightError::ProbeExecution`] errors.
    pub fn step(&self) -> Option<ProbeStep> {
        match self {
            PreflightError::ProbeExecution { step, .. } => Some(*step),
            _ => None,
        }
    }
}

impl Serialize for PreflightError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("PreflightError", 3)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("step", &self.step())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}
