//! The identity the preflight checks run as.
//!
//! This is passed explicitly to the probes that care about it instead of
//! being looked up ad hoc, so tests can run every probe as any user.

use std::path::Path;

use rustix::process::{getgid, getuid};
use serde::Serialize;

use crate::{error::Result, procfs::read_optional};

/// Default location of the passwd database.
pub const ETC_PASSWD: &str = "/etc/passwd";

/// A user identity: numeric ids and, when resolvable, the user name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub name: Option<String>,
}

impl Identity {
    pub fn new(uid: u32, gid: u32, name: Option<&str>) -> Identity {
        Identity {
            uid,
            gid,
            name: name.map(str::to_string),
        }
    }

    /// The identity of the current process, with the name looked up in `passwd`.
    pub fn current(passwd: impl AsRef<Path>) -> Result<Identity> {
        let uid = getuid().as_raw();
        let gid = getgid().as_raw();
        let name = lookup_user_name(passwd.as_ref(), uid)?;
        Ok(Identity { uid, gid, name })
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Whether a `name:...` style key refers to this identity.
    pub fn matches(&self, key: &str) -> bool {
        self.name.as_deref() == Some(key) || key.parse::<u32>().ok() == Some(self.uid)
    }
}

/// Finds the user name for `uid` in a passwd-format file.
///
/// A missing file is not an error: minimal container images often run with
/// an arbitrary uid that has no passwd entry at all.
pub fn lookup_user_name(passwd: &Path, uid: u32) -> Result<Option<String>> {
    let Some(content) = read_optional(passwd)? else {
        return Ok(None);
    };
    let uid = uid.to_string();
    Ok(content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|fields| fields.len() > 2 && fields[2] == uid)
        .map(|fields| fields[0].to_string()))
}
