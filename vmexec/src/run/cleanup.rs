//! Best-effort deletion of guest-side artifacts.

use crate::guest::GuestOperations;
use serde::Serialize;
use std::fmt;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};
use vmexec_common::GuestCredentials;

/// What happened to one guest path during cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum CleanupOutcome {
    Deleted,
    Failed(String),
    /// Not attempted because the grace period was already over.
    Skipped,
}

impl fmt::Display for CleanupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deleted => write!(f, "deleted"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupEntry {
    pub path: String,
    pub outcome: CleanupOutcome,
}

/// Per-path cleanup results for one run. Empty when nothing was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub entries: Vec<CleanupEntry>,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every attempted path was deleted.
    pub fn is_clean(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| entry.outcome == CleanupOutcome::Deleted)
    }

    pub fn outcome_for(&self, path: &str) -> Option<&CleanupOutcome> {
        self.entries
            .iter()
            .find(|entry| entry.path == path)
            .map(|entry| &entry.outcome)
    }

    /// Paths that may still exist on the guest.
    pub fn leftovers(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|entry| entry.outcome != CleanupOutcome::Deleted)
            .map(|entry| entry.path.as_str())
    }
}

/// Delete each of `paths` once, giving up on whatever remains at `deadline`.
///
/// Failures are logged and recorded, never returned.
pub async fn cleanup_paths<G>(
    guest: &G,
    auth: &GuestCredentials,
    paths: &[&str],
    deadline: Instant,
) -> CleanupReport
where
    G: GuestOperations + ?Sized,
{
    let mut report = CleanupReport::default();

    for &path in paths {
        let outcome = if Instant::now() >= deadline {
            warn!(path, "cleanup grace period over, not deleting");
            CleanupOutcome::Skipped
        } else {
            match timeout_at(deadline, guest.delete_file(auth, path)).await {
                Ok(Ok(())) => {
                    info!(path, "deleted guest file");
                    CleanupOutcome::Deleted
                }
                Ok(Err(e)) => {
                    warn!(path, error = %e, "failed to delete guest file");
                    CleanupOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    warn!(path, "guest file deletion timed out");
                    CleanupOutcome::Failed("cleanup grace period expired".to_string())
                }
            }
        };
        report.entries.push(CleanupEntry {
            path: path.to_string(),
            outcome,
        });
    }

    report
}
