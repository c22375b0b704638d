//! Child side of the live user namespace probe.
//!
//! The probe re-executes the current binary with [`HELPER_ENV`] set.  The
//! child then tries to do exactly what a rootless build does first:
//!
//! 1. `unshare(CLONE_NEWUSER)`
//! 2. write `deny` to `/proc/self/setgroups`
//! 3. map its own uid and gid to 0 in `uid_map`/`gid_map`
//!
//! and exits.  Exit status 0 proves the whole sequence is allowed in this
//! exact sandbox; anything else is reported on stderr, where the parent
//! picks it up as the probe's diagnostic.
//!
//! With [`HELPER_ENV`] set to [`OVERLAY_MODE`] the child also unshares a
//! mount namespace and runs the overlay mount cycle of [`crate::mount`] in
//! the directory named by [`OVERLAY_ROOT_ENV`], which the parent created.
//!
//! # Usage
//!
//! Binaries using the default probe must call [`init_if_helper`] first
//! thing in `main()`, before any threads exist (`unshare(CLONE_NEWUSER)`
//! fails in a multithreaded process):
//!
//! ```no_run
//! rootless_preflight::userns_helper::init_if_helper();
//! // normal application code continues here
//! ```

use std::{io, path::PathBuf};

use rustix::{
    process::{getgid, getuid},
    thread::{unshare, UnshareFlags},
};

use crate::{
    error::{PreflightError, ProbeStep},
    mount::{mount_cycle, Overlay},
};

/// Environment variable that marks a process as the probe helper.
pub const HELPER_ENV: &str = "__ROOTLESS_PREFLIGHT_USERNS_PROBE";

/// [`HELPER_ENV`] value selecting the overlay mount cycle.
pub const OVERLAY_MODE: &str = "overlay";

/// The test root for [`OVERLAY_MODE`].
pub const OVERLAY_ROOT_ENV: &str = "__ROOTLESS_PREFLIGHT_OVERLAY_ROOT";

/// Runs the probe and exits if this process was spawned as the helper;
/// returns immediately otherwise.
pub fn init_if_helper() {
    let Some(mode) = std::env::var_os(HELPER_ENV) else {
        return;
    };

    let outcome = if mode == OVERLAY_MODE {
        overlay_cycle().map_err(|e| e.to_string())
    } else {
        enter_user_namespace(UnshareFlags::empty()).map_err(|e| e.to_string())
    };
    match outcome {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn overlay_cycle() -> Result<(), PreflightError> {
    let Some(root) = std::env::var_os(OVERLAY_ROOT_ENV).map(PathBuf::from) else {
        return Err(PreflightError::probe(
            ProbeStep::Child,
            format!("{OVERLAY_ROOT_ENV} unset"),
        ));
    };
    enter_user_namespace(UnshareFlags::NEWNS)
        .map_err(|e| PreflightError::probe(ProbeStep::Child, e))?;
    mount_cycle(&root, &Overlay { userxattr: true })
}

/// Creates a user namespace mapping the current identity to root, along
/// with the namespaces in `extra`.
fn enter_user_namespace(extra: UnshareFlags) -> io::Result<()> {
    // must be read before unsharing; afterwards both are the overflow id
    let uid = getuid().as_raw();
    let gid = getgid().as_raw();

    let what = if extra.contains(UnshareFlags::NEWNS) {
        "unshare(CLONE_NEWUSER | CLONE_NEWNS)"
    } else {
        "unshare(CLONE_NEWUSER)"
    };
    unshare(UnshareFlags::NEWUSER | extra).map_err(|e| annotate(what, e.into()))?;

    write_proc("/proc/self/setgroups", "deny")?;
    write_proc("/proc/self/uid_map", &format!("0 {uid} 1"))?;
    write_proc("/proc/self/gid_map", &format!("0 {gid} 1"))?;

    if !getuid().is_root() {
        return Err(io::Error::other(format!(
            "uid_map written but uid is {} instead of 0",
            getuid().as_raw()
        )));
    }
    Ok(())
}

fn write_proc(path: &str, content: &str) -> io::Result<()> {
    std::fs::write(path, content).map_err(|e| annotate(path, e))
}

fn annotate(what: &str, e: io::Error) -> io::Error {
    io::Error::new(e.kind(), format!("{what}: {e}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_not_a_helper() {
        // the test harness is never spawned with the marker
        assert!(std::env::var_os(HELPER_ENV).is_none());
        init_if_helper();
    }

    #[test]
    fn test_overlay_cycle_needs_root() {
        assert!(std::env::var_os(OVERLAY_ROOT_ENV).is_none());
        let err = overlay_cycle().unwrap_err();
        assert_eq!(err.step(), Some(ProbeStep::Child));
        assert!(err.to_string().contains(OVERLAY_ROOT_ENV));
    }

    #[test]
    fn test_annotate() {
        let e = annotate("/proc/self/uid_map", io::ErrorKind::PermissionDenied.into());
        assert_eq!(e.kind(), io::ErrorKind::PermissionDenied);
        assert!(e.to_string().starts_with("/proc/self/uid_map: "));
    }
}
