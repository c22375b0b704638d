//! Readers for kernel pseudo-files.
//!
//! `/proc/<pid>/status` is a list of `Name:\tvalue` lines.  We only ever need
//! a handful of fields from it (`CapEff`, `NoNewPrivs`), but keeping the whole
//! table around makes the parser trivially testable.

use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::error::{PreflightError, Result};

/// Default location of the process-status interface.
pub const PROC_SELF_STATUS: &str = "/proc/self/status";

/// Default location of the user namespace limit.
pub const MAX_USER_NAMESPACES: &str = "/proc/sys/user/max_user_namespaces";

/// A parsed process-status file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStatus {
    path: PathBuf,
    fields: BTreeMap<String, String>,
}

impl ProcStatus {
    /// Reads and parses the status file at `path`.
    pub fn read(path: impl AsRef<Path>) -> Result<ProcStatus> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| PreflightError::config(path, e))?;
        Ok(ProcStatus::parse(path, &content))
    }

    /// Parses status content.  Lines without a `:` are ignored.
    pub fn parse(path: impl Into<PathBuf>, content: &str) -> ProcStatus {
        let fields = content
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();
        ProcStatus {
            path: path.into(),
            fields,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the raw value of a field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Returns the value of a field, failing if it is absent.
    pub fn required(&self, name: &str) -> Result<&str> {
        self.field(name)
            .ok_or_else(|| PreflightError::config(&self.path, format!("no {name} field")))
    }

    /// Parses a hexadecimal field such as `CapEff: 00000000a80425fb`.
    pub fn hex_field(&self, name: &str) -> Result<u64> {
        let value = self.required(name)?;
        u64::from_str_radix(value, 16).map_err(|e| {
            PreflightError::config(&self.path, format!("invalid {name} value {value:?}: {e}"))
        })
    }

    /// Parses a `0`/`1` flag field such as `NoNewPrivs: 1`.
    pub fn flag_field(&self, name: &str) -> Result<bool> {
        match self.required(name)? {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(PreflightError::config(
                &self.path,
                format!("invalid {name} value {other:?}"),
            )),
        }
    }
}

/// Reads a single-value kernel parameter such as `/proc/sys/user/max_user_namespaces`.
pub fn read_parameter<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| PreflightError::config(path, e))?;
    let value = content.trim();
    value
        .parse()
        .map_err(|e| PreflightError::config(path, format!("invalid value {value:?}: {e}")))
}

/// Like [`std::fs::read_to_string`], but a missing file is `Ok(None)`.
pub(crate) fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PreflightError::config(path, e)),
    }
}
