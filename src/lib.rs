//! Preflight checks for unprivileged container image builds.
//!
//! Before a rootless build starts, [`preflight::Preflight`] inspects the
//! process: effective capabilities, the setuid id-mapping helpers, user
//! namespace support and the usable storage backends.  The
//! [`resolver`] turns that into a [`resolver::BuildModeVerdict`] listing
//! every unmet prerequisite, and [`report`] renders it.

pub mod capabilities;
pub mod config;
pub mod environment;
pub mod error;
pub mod identity;
pub mod mount;
pub mod preflight;
pub mod procfs;
pub mod report;
pub mod resolver;
pub mod setuid;
pub mod storage;
pub mod userns;
pub mod userns_helper;
