//! User namespace support.
//!
//! Rootless builds run inside a user namespace that maps the invoking user
//! to root.  Whether that works depends on more than permission bits:
//!
//! - `/proc/sys/user/max_user_namespaces` must be non-zero,
//! - the seccomp profile or LSM of the surrounding sandbox must allow
//!   `unshare(CLONE_NEWUSER)` and writes to `uid_map`/`gid_map`.
//!
//! The second point can only be answered by trying, so [`UserNamespaceProber`]
//! spawns a short-lived child that creates a namespace and exits.  See
//! [`crate::userns_helper`] for the child side.
//!
//! Subordinate id ranges from `/etc/subuid` and `/etc/subgid` are recorded
//! for diagnostics, but are not required: a single-id mapping works without
//! them.

use std::{
    ffi::OsString,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};

use log::{debug, warn};
use serde::Serialize;

use crate::{
    error::{PreflightError, ProbeStep, Result},
    identity::Identity,
    procfs::{read_optional, read_parameter, ProcStatus, MAX_USER_NAMESPACES, PROC_SELF_STATUS},
    userns_helper::HELPER_ENV,
};

pub const ETC_SUBUID: &str = "/etc/subuid";
pub const ETC_SUBGID: &str = "/etc/subgid";

/// Default bound on the live namespace probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How much of a child's stderr ends up in a diagnostic.
const STDERR_TAIL: u64 = 4096;

/// One `identity:start:count` line from `/etc/subuid` or `/etc/subgid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubordinateRange {
    pub owner: String,
    pub start: u64,
    pub count: u64,
}

/// Finds the first range in `content` owned by `identity`, by name or uid.
///
/// Blank lines and `#` comments are skipped.  A malformed line belonging to
/// `identity` is an error; malformed lines of other users are ignored.
pub fn parse_subordinate_ranges(
    path: &Path,
    content: &str,
    identity: &Identity,
) -> Result<Option<SubordinateRange>> {
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        let owner = fields.next().unwrap_or_default();
        if !identity.matches(owner) {
            continue;
        }
        let invalid = |reason: &str| {
            PreflightError::config(path, format!("line {}: {reason}: {line:?}", lineno + 1))
        };
        let (Some(start), Some(count), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(invalid("expected identity:start:count"));
        };
        let start = start.parse().map_err(|_| invalid("invalid start"))?;
        let count = count.parse().map_err(|_| invalid("invalid count"))?;
        return Ok(Some(SubordinateRange {
            owner: owner.to_string(),
            start,
            count,
        }));
    }
    Ok(None)
}

/// Reads the subordinate range file at `path`.  A missing file is `Ok(None)`.
pub fn read_subordinate_range(
    path: &Path,
    identity: &Identity,
) -> Result<Option<SubordinateRange>> {
    match read_optional(path)? {
        Some(content) => parse_subordinate_ranges(path, &content, identity),
        None => Ok(None),
    }
}

/// Everything known about user namespace support for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserNamespaceStatus {
    /// `max_user_namespaces` is greater than zero.
    pub supported: bool,
    pub max_namespaces: u64,
    pub subuid: Option<SubordinateRange>,
    pub subgid: Option<SubordinateRange>,
    /// The live probe created a namespace.
    pub can_create: bool,
    /// Why the live probe failed, or why subordinate ranges couldn't be read.
    pub error: Option<String>,
    /// The live probe failure, if any, with its failing step.
    #[serde(skip)]
    pub probe_error: Option<PreflightError>,
}

impl UserNamespaceStatus {
    /// Kernel support and a successful live probe.  Subordinate ranges are
    /// advisory and don't count.
    pub fn ready(&self) -> bool {
        self.supported && self.can_create
    }
}

/// The path of the running binary.
pub(crate) fn running_binary() -> Result<PathBuf> {
    std::fs::read_link("/proc/self/exe").map_err(|e| PreflightError::config("/proc/self/exe", e))
}

/// The command run as the live namespace probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCommand {
    /// Re-execute a binary that calls [`crate::userns_helper::init_if_helper`]
    /// at startup, with the helper marker set.
    Helper(PathBuf),
    /// Run an arbitrary command; exit status zero means success.
    Command(Vec<OsString>),
}

impl ProbeCommand {
    /// Re-executes the current binary as the probe helper.
    pub fn current_exe() -> Result<ProbeCommand> {
        running_binary().map(ProbeCommand::Helper)
    }

    /// The util-linux `unshare` tool, for callers that don't embed the helper.
    pub fn unshare() -> ProbeCommand {
        ProbeCommand::Command(
            ["unshare", "--user", "--map-root-user", "true"]
                .into_iter()
                .map(OsString::from)
                .collect(),
        )
    }

    fn command(&self) -> Result<Command> {
        match self {
            ProbeCommand::Helper(exe) => {
                let mut cmd = Command::new(exe);
                cmd.env(HELPER_ENV, "1");
                Ok(cmd)
            }
            ProbeCommand::Command(argv) => {
                let Some((program, args)) = argv.split_first() else {
                    return Err(PreflightError::probe(ProbeStep::Spawn, "empty probe command"));
                };
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
        }
    }
}

/// Kills and reaps the child unless it was already waited for.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn wait_timeout(&mut self, timeout: Duration) -> Result<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.reaped = true;
                    return Ok(status);
                }
                Ok(None) if Instant::now() >= deadline => {
                    return Err(PreflightError::probe(
                        ProbeStep::Timeout,
                        format!("child did not exit within {timeout:?}"),
                    ));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(PreflightError::probe(ProbeStep::Wait, e)),
            }
        }
    }

}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// How a bounded child ended.
#[derive(Debug)]
pub(crate) struct ChildOutput {
    pub status: ExitStatus,
    /// The trimmed tail of whatever the child wrote to stderr.
    pub stderr: String,
}

/// Runs `cmd` to completion, waiting at most `timeout`.
///
/// stderr goes to an anonymous file rather than a pipe, so a chatty child
/// can't stall on a full pipe while nobody reads it.
pub(crate) fn run_bounded(mut cmd: Command, timeout: Duration) -> Result<ChildOutput> {
    let mut stderr = tempfile::tempfile().map_err(|e| PreflightError::probe(ProbeStep::Spawn, e))?;
    let child_stderr = stderr
        .try_clone()
        .map_err(|e| PreflightError::probe(ProbeStep::Spawn, e))?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(child_stderr));
    debug!("running {cmd:?}");

    let child = cmd
        .spawn()
        .map_err(|e| PreflightError::probe(ProbeStep::Spawn, format!("{cmd:?}: {e}")))?;
    let mut guard = ChildGuard {
        child,
        reaped: false,
    };
    let status = guard.wait_timeout(timeout)?;

    Ok(ChildOutput {
        status,
        stderr: read_tail(&mut stderr).unwrap_or_default(),
    })
}

fn read_tail(file: &mut File) -> std::io::Result<String> {
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(len.saturating_sub(STDERR_TAIL)))?;
    let mut tail = vec![];
    file.read_to_end(&mut tail)?;
    Ok(String::from_utf8_lossy(&tail).trim().to_string())
}

/// Probes user namespace support for a given identity.
#[derive(Debug, Clone)]
pub struct UserNamespaceProber {
    identity: Identity,
    proc_status: PathBuf,
    max_user_namespaces: PathBuf,
    subuid: PathBuf,
    subgid: PathBuf,
    command: ProbeCommand,
    timeout: Duration,
}

impl UserNamespaceProber {
    /// A prober using the standard host paths.
    pub fn new(identity: Identity, command: ProbeCommand) -> UserNamespaceProber {
        UserNamespaceProber {
            identity,
            proc_status: PROC_SELF_STATUS.into(),
            max_user_namespaces: MAX_USER_NAMESPACES.into(),
            subuid: ETC_SUBUID.into(),
            subgid: ETC_SUBGID.into(),
            command,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn proc_status(mut self, path: impl Into<PathBuf>) -> Self {
        self.proc_status = path.into();
        self
    }

    pub fn max_user_namespaces(mut self, path: impl Into<PathBuf>) -> Self {
        self.max_user_namespaces = path.into();
        self
    }

    pub fn subid_files(mut self, subuid: impl Into<PathBuf>, subgid: impl Into<PathBuf>) -> Self {
        self.subuid = subuid.into();
        self.subgid = subgid.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reads `max_user_namespaces`; namespaces are supported iff it is > 0.
    pub fn max_namespaces(&self) -> Result<u64> {
        read_parameter(&self.max_user_namespaces)
    }

    /// Whether `no_new_privs` is set on this process.  If it is, setuid
    /// binaries can never gain privileges, whatever their mode says.
    pub fn no_new_privs(&self) -> Result<bool> {
        ProcStatus::read(&self.proc_status)?.flag_field("NoNewPrivs")
    }

    /// Runs the live probe: spawn the child, wait for it (bounded), and
    /// report how it ended.  The child is killed and reaped on every path.
    pub fn live_probe(&self) -> Result<()> {
        let ChildOutput { status, stderr } = run_bounded(self.command.command()?, self.timeout)?;
        if status.success() {
            Ok(())
        } else {
            let detail = if stderr.is_empty() {
                format!("probe exited with {status}")
            } else {
                format!("probe exited with {status}: {stderr}")
            };
            Err(PreflightError::probe(ProbeStep::Child, detail))
        }
    }

    /// Full probe.  Fails only if `max_user_namespaces` can't be read; live
    /// probe and subordinate id problems are recorded in the status.
    pub fn probe(&self) -> Result<UserNamespaceStatus> {
        let max_namespaces = self.max_namespaces()?;
        let supported = max_namespaces > 0;
        debug!("max_user_namespaces: {max_namespaces}");

        let mut errors = vec![];
        let mut subid = |path: &Path| match read_subordinate_range(path, &self.identity) {
            Ok(range) => range,
            Err(e) => {
                warn!("{e}");
                errors.push(e.to_string());
                None
            }
        };
        let subuid = subid(&self.subuid);
        let subgid = subid(&self.subgid);

        // don't bother spawning anything if the kernel says no
        let probe_error = if supported {
            self.live_probe().err()
        } else {
            None
        };
        if let Some(e) = &probe_error {
            warn!("userns probe failed: {e}");
            errors.insert(0, e.to_string());
        }
        if !supported {
            errors.insert(0, "user namespaces are disabled (max_user_namespaces = 0)".into());
        }

        Ok(UserNamespaceStatus {
            supported,
            max_namespaces,
            subuid,
            subgid,
            can_create: supported && probe_error.is_none(),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            probe_error,
        })
    }
}
