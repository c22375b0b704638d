//! Inspection of the `newuidmap`/`newgidmap` helpers.
//!
//! When the build process holds no capabilities of its own, id mappings can
//! still be written by the setuid-root shadow-utils helpers.  This only
//! looks at file metadata, it never executes either binary.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use log::debug;
use serde::Serialize;

/// Set-user-ID permission bit.
const S_ISUID: u32 = 0o4000;

/// Conventional install locations, searched in order.
pub const DEFAULT_SEARCH_DIRS: &[&str] = &[
    "/usr/bin",
    "/usr/sbin",
    "/bin",
    "/sbin",
    "/usr/local/bin",
    "/usr/local/sbin",
];

pub const NEWUIDMAP: &str = "newuidmap";
pub const NEWGIDMAP: &str = "newgidmap";

/// On-disk state of one helper binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HelperBinary {
    pub name: &'static str,
    /// The first regular file found with this name, if any.
    pub path: Option<PathBuf>,
    pub setuid: bool,
}

impl HelperBinary {
    pub fn present(&self) -> bool {
        self.path.is_some()
    }

    pub fn usable(&self) -> bool {
        self.present() && self.setuid
    }
}

/// On-disk state of both id-mapping helpers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetuidBinaryStatus {
    pub newuidmap: HelperBinary,
    pub newgidmap: HelperBinary,
}

impl SetuidBinaryStatus {
    /// Both helpers are present and both carry the set-user-ID bit.
    pub fn usable(&self) -> bool {
        self.newuidmap.usable() && self.newgidmap.usable()
    }

    pub fn binaries(&self) -> [&HelperBinary; 2] {
        [&self.newuidmap, &self.newgidmap]
    }
}

/// Locates the id-mapping helpers in a fixed list of directories.
#[derive(Debug, Clone)]
pub struct SetuidBinaryInspector {
    search_dirs: Vec<PathBuf>,
}

impl Default for SetuidBinaryInspector {
    fn default() -> Self {
        SetuidBinaryInspector::new(DEFAULT_SEARCH_DIRS.iter().map(PathBuf::from))
    }
}

impl SetuidBinaryInspector {
    pub fn new(search_dirs: impl IntoIterator<Item = PathBuf>) -> SetuidBinaryInspector {
        SetuidBinaryInspector {
            search_dirs: search_dirs.into_iter().collect(),
        }
    }

    /// Inspects both helpers.  The result is never cached: the binaries may
    /// be reinstalled between runs.
    pub fn inspect(&self) -> SetuidBinaryStatus {
        SetuidBinaryStatus {
            newuidmap: self.inspect_binary(NEWUIDMAP),
            newgidmap: self.inspect_binary(NEWGIDMAP),
        }
    }

    fn inspect_binary(&self, name: &'static str) -> HelperBinary {
        for dir in &self.search_dirs {
            let candidate = dir.join(name);
            // follows symlinks: the bit that matters is on the target
            let Ok(metadata) = std::fs::metadata(&candidate) else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let setuid = metadata.permissions().mode() & S_ISUID != 0;
            debug!("found {} (setuid: {setuid})", candidate.display());
            return HelperBinary {
                name,
                path: Some(absolute(&candidate)),
                setuid,
            };
        }
        debug!("{name} not found in {:?}", self.search_dirs);
        HelperBinary {
            name,
            path: None,
            setuid: false,
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
