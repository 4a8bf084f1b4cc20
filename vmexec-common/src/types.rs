//! Common types used across vmexec components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the target virtual machine (its inventory name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmTarget(pub String);

impl VmTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Username/password pair used for every guest operation.
///
/// The password is never printed: `Debug` redacts it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCredentials {
    pub username: String,
    pub password: String,
}

impl GuestCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for GuestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Guest-side process identifier as reported by the guest operations API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub i64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// POSIX ownership and permission bits requested for an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixFileAttributes {
    pub owner_id: u32,
    pub group_id: u32,
    pub permissions: u32,
}

impl Default for PosixFileAttributes {
    /// root:root, world-executable.
    fn default() -> Self {
        Self {
            owner_id: 0,
            group_id: 0,
            permissions: 0o777,
        }
    }
}

impl PosixFileAttributes {
    /// Permission bits rendered as an octal string (e.g. `"0777"`).
    pub fn permissions_octal(&self) -> String {
        format!("{:04o}", self.permissions)
    }
}

/// One entry of a process-listing response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: ProcessId,
    /// Set once the process has exited.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Exit code of the launched command; meaningful only when `end_time` is set.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Status of a launched guest process, derived on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ProcessStatus {
    /// The listing did not contain the process.
    Unknown,
    /// The process is still running.
    Running,
    /// The process reported an end time.
    Completed { exit_code: i32 },
    /// No completion was observed before the completion deadline.
    TimedOut,
}

impl ProcessStatus {
    /// Derive the status of `pid` from one listing response.
    pub fn from_listing(pid: ProcessId, listing: &[ProcessInfo]) -> Self {
        match listing.iter().find(|info| info.pid == pid) {
            None => Self::Unknown,
            Some(info) if info.end_time.is_some() => Self::Completed {
                exit_code: info.exit_code.unwrap_or_default(),
            },
            Some(_) => Self::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::TimedOut)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Running => write!(f, "running"),
            Self::Completed { exit_code } => write!(f, "completed (exit {exit_code})"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Everything needed to start one run. Immutable once the run starts.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub target: VmTarget,
    pub credentials: GuestCredentials,
    pub script: Vec<u8>,
}

impl RunRequest {
    pub fn new(target: VmTarget, credentials: GuestCredentials, script: impl Into<Vec<u8>>) -> Self {
        Self {
            target,
            credentials,
            script: script.into(),
        }
    }
}
