//! Live overlay mount test.
//!
//! Permission bits only tell us that an overlay mount *should* work.  Seccomp
//! profiles, LSMs and kernel configuration can all still refuse it, so before
//! recommending the overlay backend we perform a real mount cycle in a
//! private temporary tree:
//!
//! 1. create `lower`, `upper`, `work` and `merged`, with a marker in `lower`
//! 2. mount overlayfs on `merged` via the fsopen()/fsconfig()/fsmount() API
//! 3. write a second marker through `merged`
//! 4. check that it was copied up into `upper`
//! 5. unmount
//!
//! An unprivileged process can only mount overlayfs inside a user namespace
//! it owns, so by default steps 1-5 run in a helper child that enters fresh
//! user and mount namespaces first (see [`crate::userns_helper`]).  The tree
//! is created and removed by the calling process on every exit path.

use std::{
    fs::{canonicalize, create_dir, read_dir, set_permissions, Permissions},
    os::{
        fd::{AsFd, BorrowedFd, OwnedFd},
        unix::fs::PermissionsExt,
    },
    path::{Path, PathBuf},
    process::Command,
    time::{Duration, Instant},
};

use log::{debug, warn};
use rustix::{
    mount::{
        fsconfig_create, fsconfig_set_flag, fsconfig_set_string, fsmount, fsopen, move_mount,
        unmount, FsMountFlags, FsOpenFlags, MountAttrFlags, MoveMountFlags, UnmountFlags,
    },
    time::{clock_gettime, ClockId},
};

use crate::{
    error::{PreflightError, ProbeStep, Result},
    storage::MountTestResult,
    userns::{run_bounded, ChildOutput},
    userns_helper::{HELPER_ENV, OVERLAY_MODE, OVERLAY_ROOT_ENV},
};

const LOWER_MARKER: &str = "lower-marker";
const UPPER_MARKER: &str = "merged-marker";
const MARKER_CONTENT: &[u8] = b"rootless-preflight\n";

/// A filesystem context created by `fsopen()`.
///
/// The kernel queues human-readable diagnostics on the context fd; they are
/// far more useful than a bare errno, so failures include them.
#[derive(Debug)]
struct FsContext {
    fd: OwnedFd,
}

impl FsContext {
    fn open(name: &str) -> rustix::io::Result<FsContext> {
        Ok(FsContext {
            fd: fsopen(name, FsOpenFlags::FSOPEN_CLOEXEC)?,
        })
    }

    /// Drains the kernel's log messages for this context.
    fn messages(&self) -> Vec<String> {
        let mut messages = vec![];
        let mut buffer = [0u8; 1024];
        loop {
            match rustix::io::read(&self.fd, &mut buffer) {
                Err(_) | Ok(0) => return messages, // ENODATA once drained
                Ok(size) => messages.push(String::from_utf8_lossy(&buffer[..size]).into_owned()),
            }
        }
    }

    fn error(&self, what: &str, errno: rustix::io::Errno) -> PreflightError {
        let messages = self.messages();
        if messages.is_empty() {
            PreflightError::probe(ProbeStep::Mount, format!("{what}: {errno}"))
        } else {
            PreflightError::probe(
                ProbeStep::Mount,
                format!("{what}: {errno} ({})", messages.join("; ")),
            )
        }
    }
}

impl AsFd for FsContext {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// An attached overlay mount, detached on drop unless it was already
/// unmounted cleanly.
#[derive(Debug)]
pub(crate) struct MountGuard {
    target: PathBuf,
    mounted: bool,
}

impl MountGuard {
    fn unmount(&mut self) -> Result<()> {
        unmount(&self.target, UnmountFlags::empty())
            .map_err(|e| PreflightError::probe(ProbeStep::Unmount, e))?;
        self.mounted = false;
        Ok(())
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = unmount(&self.target, UnmountFlags::DETACH) {
                warn!("failed to detach {}: {e}", self.target.display());
            }
        }
    }
}

/// The four overlay directories, canonicalized.
#[derive(Debug)]
pub(crate) struct Layers {
    lower: PathBuf,
    upper: PathBuf,
    work: PathBuf,
    merged: PathBuf,
}

/// Checks that `candidate` resolves to a directory inside `root` and can be
/// passed as an overlay mount option.
///
/// Returns the canonical path.  `,` and `:` separate overlay options and
/// lower layers respectively, so paths containing them are refused rather
/// than escaped.
pub fn validate_layer_path(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let fail = |reason: String| PreflightError::probe(ProbeStep::CreateDirs, reason);
    let root = canonicalize(root).map_err(|e| fail(format!("{}: {e}", root.display())))?;
    let path =
        canonicalize(candidate).map_err(|e| fail(format!("{}: {e}", candidate.display())))?;
    if path == root || !path.starts_with(&root) {
        return Err(fail(format!(
            "{} escapes test root {}",
            path.display(),
            root.display()
        )));
    }
    if !path.is_dir() {
        return Err(fail(format!("{} is not a directory", path.display())));
    }
    match path.to_str() {
        Some(s) if !s.contains([',', ':', '\n']) => Ok(path),
        _ => Err(fail(format!(
            "{} can't be used as an overlay option",
            path.display()
        ))),
    }
}

/// A process-unique name prefix derived from the monotonic clock.
fn unique_prefix() -> String {
    let now = clock_gettime(ClockId::Monotonic);
    format!(
        "overlay-probe-{}-{}{:09}-",
        rustix::process::getpid().as_raw_nonzero(),
        now.tv_sec,
        now.tv_nsec
    )
}

/// Attaches an overlay of `layers` on `layers.merged`.
pub(crate) trait Attach {
    fn attach(&self, layers: &Layers) -> Result<MountGuard>;
}

/// The kernel's overlayfs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Overlay {
    pub userxattr: bool,
}

impl Attach for Overlay {
    fn attach(&self, layers: &Layers) -> Result<MountGuard> {
        let overlay = FsContext::open("overlay")
            .map_err(|e| PreflightError::probe(ProbeStep::Mount, format!("fsopen(overlay): {e}")))?;
        let fd = overlay.as_fd();

        fsconfig_set_string(fd, "source", "rootless-preflight")
            .map_err(|e| overlay.error("source", e))?;
        fsconfig_set_string(fd, "lowerdir", &layers.lower)
            .map_err(|e| overlay.error("lowerdir", e))?;
        fsconfig_set_string(fd, "upperdir", &layers.upper)
            .map_err(|e| overlay.error("upperdir", e))?;
        fsconfig_set_string(fd, "workdir", &layers.work)
            .map_err(|e| overlay.error("workdir", e))?;
        if self.userxattr {
            fsconfig_set_flag(fd, "userxattr").map_err(|e| overlay.error("userxattr", e))?;
        }
        fsconfig_create(fd).map_err(|e| overlay.error("fsconfig_create", e))?;

        let mnt = fsmount(fd, FsMountFlags::FSMOUNT_CLOEXEC, MountAttrFlags::empty())
            .map_err(|e| overlay.error("fsmount", e))?;
        move_mount(
            mnt.as_fd(),
            "",
            rustix::fs::CWD,
            &layers.merged,
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )
        .map_err(|e| overlay.error("move_mount", e))?;

        debug!("overlay mounted on {}", layers.merged.display());
        Ok(MountGuard {
            target: layers.merged.clone(),
            mounted: true,
        })
    }
}

/// Steps 1-5 inside an existing, empty test root.
pub(crate) fn mount_cycle(root: &Path, attach: &dyn Attach) -> Result<()> {
    let layers = create_layers(root)?;

    let mut guard = attach.attach(&layers)?;

    std::fs::write(layers.merged.join(UPPER_MARKER), MARKER_CONTENT)
        .map_err(|e| PreflightError::probe(ProbeStep::Write, e))?;

    verify_upper(&layers)?;

    guard.unmount()
}

/// Where the mount cycle runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountRunner {
    /// In the calling process.  Needs `CAP_SYS_ADMIN` in its user namespace.
    InProcess,
    /// In `helper`, re-executed with the helper marker, inside new user and
    /// mount namespaces.  Always mounts with `userxattr`.
    Namespace { helper: PathBuf, timeout: Duration },
}

/// Performs a real overlay mount cycle in a temporary directory.
#[derive(Debug, Clone)]
pub struct OverlayMountTest {
    base: PathBuf,
    userxattr: bool,
    runner: MountRunner,
}

impl OverlayMountTest {
    /// The test tree is created inside `base`.
    pub fn new(base: impl Into<PathBuf>) -> OverlayMountTest {
        OverlayMountTest {
            base: base.into(),
            userxattr: false,
            runner: MountRunner::InProcess,
        }
    }

    /// Mount with `userxattr`, as overlayfs requires inside a user namespace.
    pub fn userxattr(mut self, enable: bool) -> OverlayMountTest {
        self.userxattr = enable;
        self
    }

    pub fn runner(mut self, runner: MountRunner) -> OverlayMountTest {
        self.runner = runner;
        self
    }

    /// Runs the test.  Failures are reported in the result, never panicked
    /// on, and the test tree is gone by the time this returns.
    pub fn run(&self) -> MountTestResult {
        match &self.runner {
            MountRunner::InProcess => {
                let overlay = Overlay {
                    userxattr: self.userxattr,
                };
                self.run_with(|root| mount_cycle(root, &overlay))
            }
            MountRunner::Namespace { helper, timeout } => {
                self.run_with(|root| cycle_in_namespace(helper, root, *timeout))
            }
        }
    }

    fn run_with(&self, cycle: impl FnOnce(&Path) -> Result<()>) -> MountTestResult {
        let start = Instant::now();
        let prefix = unique_prefix();

        let root = match tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&self.base)
        {
            Ok(root) => root,
            Err(e) => {
                let workdir = self.base.join(&prefix);
                let error = PreflightError::probe(
                    ProbeStep::CreateDirs,
                    format!("{}: {e}", self.base.display()),
                );
                warn!("overlay mount test: {error}");
                return MountTestResult {
                    success: false,
                    error: Some(error),
                    workdir,
                    elapsed: start.elapsed(),
                };
            }
        };
        let workdir = root.path().to_path_buf();

        let mut outcome = cycle(root.path());

        open_up(root.path());
        if let Err(e) = root.close() {
            warn!("failed to remove {}: {e}", workdir.display());
            if outcome.is_ok() {
                outcome = Err(PreflightError::probe(
                    ProbeStep::Unmount,
                    format!("removing {}: {e}", workdir.display()),
                ));
            }
        }

        let elapsed = start.elapsed();
        match outcome {
            Ok(()) => {
                debug!("overlay mount test passed in {elapsed:?}");
                MountTestResult {
                    success: true,
                    error: None,
                    workdir,
                    elapsed,
                }
            }
            Err(error) => {
                warn!("overlay mount test: {error}");
                MountTestResult {
                    success: false,
                    error: Some(error),
                    workdir,
                    elapsed,
                }
            }
        }
    }
}

/// Runs the cycle in a helper child that owns its user and mount namespaces.
/// The child reports a failing step on stderr in its `Display` form.
fn cycle_in_namespace(helper: &Path, root: &Path, timeout: Duration) -> Result<()> {
    let mut cmd = Command::new(helper);
    cmd.env(HELPER_ENV, OVERLAY_MODE).env(OVERLAY_ROOT_ENV, root);

    let ChildOutput { status, stderr } = run_bounded(cmd, timeout)?;
    if status.success() {
        return Ok(());
    }
    Err(PreflightError::parse_step_failure(&stderr).unwrap_or_else(|| {
        let detail = if stderr.is_empty() {
            format!("mount helper exited with {status}")
        } else {
            format!("mount helper exited with {status}: {stderr}")
        };
        PreflightError::probe(ProbeStep::Child, detail)
    }))
}

/// overlayfs leaves `work/work` with mode 000 behind; make every directory
/// accessible again so the tree can be removed.
fn open_up(dir: &Path) {
    let _ = set_permissions(dir, Permissions::from_mode(0o700));
    let Ok(entries) = read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            open_up(&entry.path());
        }
    }
}

fn create_layers(root: &Path) -> Result<Layers> {
    let make = |name: &str| -> Result<PathBuf> {
        let path = root.join(name);
        create_dir(&path)
            .map_err(|e| PreflightError::probe(ProbeStep::CreateDirs, format!("{name}: {e}")))?;
        validate_layer_path(root, &path)
    };
    let layers = Layers {
        lower: make("lower")?,
        upper: make("upper")?,
        work: make("work")?,
        merged: make("merged")?,
    };
    std::fs::write(layers.lower.join(LOWER_MARKER), MARKER_CONTENT)
        .map_err(|e| PreflightError::probe(ProbeStep::CreateDirs, format!("lower marker: {e}")))?;
    Ok(layers)
}

fn verify_upper(layers: &Layers) -> Result<()> {
    let fail = |reason: String| PreflightError::probe(ProbeStep::VerifyUpper, reason);

    if !layers.merged.join(LOWER_MARKER).exists() {
        return Err(fail("lower layer not visible in merged view".into()));
    }
    let copied = layers.upper.join(UPPER_MARKER);
    match std::fs::read(&copied) {
        Ok(content) if content == MARKER_CONTENT => Ok(()),
        Ok(_) => Err(fail(format!("{} has unexpected content", copied.display()))),
        Err(e) => Err(fail(format!("{}: {e}", copied.display()))),
    }
}
