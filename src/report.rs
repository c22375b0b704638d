//! Rendering of a [`PreflightReport`] for humans and machines.

use std::{
    fmt::{self, Write as _},
    process::ExitCode,
};

use crate::{
    error::Result,
    preflight::PreflightReport,
    resolver::Mechanism,
    setuid::HelperBinary,
    userns::SubordinateRange,
};

/// Exit status of a run whose build can proceed.
pub const EXIT_PROCEED: u8 = 0;
/// Exit status of a run whose build is blocked.
pub const EXIT_BLOCKED: u8 = 1;
/// Exit status for invalid input (bad flags, bad configuration).
pub const EXIT_INVALID: u8 = 2;

/// Renders a finished preflight run.
#[derive(Debug)]
pub struct EnvironmentReporter<'a> {
    report: &'a PreflightReport,
}

impl<'a> EnvironmentReporter<'a> {
    pub fn new(report: &'a PreflightReport) -> EnvironmentReporter<'a> {
        EnvironmentReporter { report }
    }

    pub fn exit_status(&self) -> u8 {
        if self.report.proceed() {
            EXIT_PROCEED
        } else {
            EXIT_BLOCKED
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self.report)
    }

    /// The field-by-field text report.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        // writing to a String can't fail
        let _ = self.write_text(&mut out);
        out
    }

    fn write_text(&self, out: &mut String) -> fmt::Result {
        let report = self.report;

        let name = report.identity.name.as_deref().unwrap_or("?");
        writeln!(
            out,
            "identity:          {name} (uid {}, gid {})",
            report.identity.uid, report.identity.gid
        )?;
        writeln!(out, "environment:       {}", report.environment)?;

        writeln!(out, "capabilities:")?;
        match &report.capabilities {
            Ok(caps) => {
                writeln!(out, "  effective:       {:016x}", caps.effective())?;
                for (name, held) in [
                    ("CAP_SETUID", caps.setuid()),
                    ("CAP_SETGID", caps.setgid()),
                    ("CAP_DAC_OVERRIDE", caps.dac_override()),
                    ("CAP_MKNOD", caps.mknod()),
                ] {
                    writeln!(out, "  {name:<17}{}", yes_no(held))?;
                }
            }
            Err(e) => writeln!(out, "  error:           {e}")?,
        }
        let no_new_privs = result_text(&report.no_new_privs, |v| yes_no(*v).into());
        writeln!(out, "no_new_privs:      {no_new_privs}")?;

        writeln!(out, "setuid helpers:")?;
        for helper in report.setuid.binaries() {
            writeln!(out, "  {:<17}{}", helper.name, helper_text(helper))?;
        }

        writeln!(out, "user namespaces:")?;
        match &report.userns {
            Ok(status) => {
                writeln!(out, "  max:             {}", status.max_namespaces)?;
                writeln!(out, "  subuid:          {}", range_text(status.subuid.as_ref()))?;
                writeln!(out, "  subgid:          {}", range_text(status.subgid.as_ref()))?;
                writeln!(out, "  can create:      {}", yes_no(status.can_create))?;
                if let Some(error) = &status.error {
                    writeln!(out, "  error:           {error}")?;
                }
            }
            Err(e) => writeln!(out, "  error:           {e}")?,
        }

        writeln!(out, "storage:")?;
        writeln!(out, "  requested:       {}", report.requested)?;
        writeln!(out, "  rootless mounts: {}", yes_no(report.rootless_mount_semantics))?;
        for backend in crate::storage::StorageBackend::ALL {
            let available = if report.storage.is_available(backend) {
                "available"
            } else {
                "unavailable"
            };
            writeln!(out, "  {:<17}{available}", backend.as_str())?;
        }
        if let Some(test) = &report.storage.mount_test {
            let outcome = match &test.error {
                None => "passed".to_string(),
                Some(e) => format!("failed: {e}"),
            };
            let millis = test.elapsed.as_secs_f64() * 1000.0;
            writeln!(out, "  mount test:      {outcome} ({millis:.1} ms)")?;
        }

        let verdict = &report.verdict;
        writeln!(out, "verdict:")?;
        if verdict.mechanism == Mechanism::Unavailable {
            writeln!(out, "  result:          blocked")?;
        } else {
            writeln!(out, "  result:          proceed")?;
            writeln!(out, "  mechanism:       {}", verdict.mechanism)?;
        }
        writeln!(out, "  storage driver:  {}", verdict.backend)?;

        if !verdict.unmet.is_empty() {
            writeln!(out, "unmet requirements:")?;
            for unmet in &verdict.unmet {
                let severity = if unmet.blocking() {
                    "blocking"
                } else if unmet.advisory() {
                    "advisory"
                } else {
                    "storage"
                };
                writeln!(out, "  - {unmet} [{}, {severity}]", unmet.kind())?;
                writeln!(out, "    {}", unmet.remediation())?;
            }
        }
        Ok(())
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn result_text<T>(result: &Result<T>, f: impl FnOnce(&T) -> String) -> String {
    match result {
        Ok(value) => f(value),
        Err(e) => format!("unknown ({e})"),
    }
}

fn helper_text(helper: &HelperBinary) -> String {
    match &helper.path {
        None => "not found".into(),
        Some(path) if helper.setuid => format!("{} (setuid)", path.display()),
        Some(path) => format!("{} (not setuid)", path.display()),
    }
}

fn range_text(range: Option<&SubordinateRange>) -> String {
    match range {
        Some(range) => format!("{}:{}:{}", range.owner, range.start, range.count),
        None => "none".into(),
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        capabilities::{Capability, CapabilitySnapshot},
        environment::Environment,
        error::PreflightError,
        identity::Identity,
        resolver::{BuildModeVerdict, UnmetRequirement},
        setuid::SetuidBinaryStatus,
        storage::{StorageBackend, StorageDriverAvailability},
        userns::UserNamespaceStatus,
    };

    fn report(verdict: BuildModeVerdict) -> PreflightReport {
        PreflightReport {
            identity: Identity::new(1000, 1000, Some("builder")),
            environment: verdict.environment,
            requested: StorageBackend::Overlay,
            rootless_mount_semantics: false,
            capabilities: Ok(CapabilitySnapshot::from_mask(0xc0)),
            no_new_privs: Err(PreflightError::config("/proc/self/status", "no NoNewPrivs field")),
            setuid: SetuidBinaryStatus {
                newuidmap: HelperBinary {
                    name: "newuidmap",
                    path: Some(PathBuf::from("/usr/bin/newuidmap")),
                    setuid: true,
                },
                newgidmap: HelperBinary {
                    name: "newgidmap",
                    path: None,
                    setuid: false,
                },
            },
            userns: Ok(UserNamespaceStatus {
                supported: true,
                max_namespaces: 15000,
                subuid: Some(SubordinateRange {
                    owner: "builder".into(),
                    start: 100000,
                    count: 65536,
                }),
                subgid: None,
                can_create: true,
                error: None,
                probe_error: None,
            }),
            storage: StorageDriverAvailability {
                vfs: true,
                native: true,
                overlay: false,
                mount_test: None,
            },
            verdict,
        }
    }

    fn proceeding() -> BuildModeVerdict {
        BuildModeVerdict {
            mechanism: Mechanism::Capabilities,
            environment: Environment::Standalone,
            backend: StorageBackend::Native,
            unmet: vec![UnmetRequirement::OverlayCapability(Capability::MKNOD)],
        }
    }

    #[test]
    fn test_exit_status() {
        let ok = report(proceeding());
        assert_eq!(EnvironmentReporter::new(&ok).exit_status(), EXIT_PROCEED);

        let blocked = report(BuildModeVerdict {
            mechanism: Mechanism::Unavailable,
            environment: Environment::Orchestrator,
            backend: StorageBackend::Overlay,
            unmet: vec![UnmetRequirement::RootUnderOrchestrator],
        });
        assert_eq!(EnvironmentReporter::new(&blocked).exit_status(), EXIT_BLOCKED);
    }

    #[test]
    fn test_text_report() {
        let report = report(proceeding());
        let text = EnvironmentReporter::new(&report).to_text();
        for line in [
            "identity:          builder (uid 1000, gid 1000)",
            "  effective:       00000000000000c0",
            "  CAP_SETUID       yes",
            "  CAP_MKNOD        no",
            "no_new_privs:      unknown (cannot use /proc/self/status: no NoNewPrivs field)",
            "  newuidmap        /usr/bin/newuidmap (setuid)",
            "  newgidmap        not found",
            "  subuid:          builder:100000:65536",
            "  subgid:          none",
            "  overlay          unavailable",
            "  result:          proceed",
            "  mechanism:       capabilities",
            "  storage driver:  native",
            "  - CAP_MKNOD [capability-denied, storage]",
        ] {
            assert!(text.lines().any(|l| l == line), "missing {line:?} in\n{text}");
        }
    }

    #[test]
    fn test_json_report() {
        let report = report(proceeding());
        let json = EnvironmentReporter::new(&report).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["verdict"]["mechanism"], "capabilities");
        assert_eq!(value["verdict"]["backend"], "native");
        assert_eq!(value["verdict"]["unmet"][0]["message"], "CAP_MKNOD");
        assert_eq!(value["verdict"]["unmet"][0]["blocking"], false);
        assert_eq!(value["capabilities"]["Ok"]["effective"], 0xc0);
        assert_eq!(value["capabilities"]["Ok"]["setuid"], true);
        assert_eq!(value["capabilities"]["Ok"]["mknod"], false);
        assert_eq!(value["no_new_privs"]["Err"]["kind"], "configuration");
        assert_eq!(value["environment"], "standalone");
    }
}
