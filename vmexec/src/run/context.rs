//! Per-run state: unique guest paths and what has been created so far.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use vmexec_common::ProcessId;

static LAST_SUFFIX: AtomicU64 = AtomicU64::new(0);

/// Process-wide strictly increasing suffix, seeded from the wall clock in
/// nanoseconds.
///
/// Two calls never return the same value, even when the clock is coarse or
/// steps backwards.
pub fn unique_suffix() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();

    let previous = LAST_SUFFIX
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last.saturating_add(1)))
        })
        .unwrap_or_else(|last| last);
    now.max(previous.saturating_add(1))
}

/// State owned by the orchestrator for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub suffix: u64,
    pub script_path: String,
    pub output_path: String,
    pub pid: Option<ProcessId>,
    /// Set once at launch; polling gives up on the process after this.
    pub completion_deadline: Option<Instant>,
    /// An upload handle was requested, so the script path may exist.
    pub staging_requested: bool,
    /// A launch was requested, so the output path may exist.
    pub launch_requested: bool,
    /// The launched process was seen to finish.
    pub process_finished: bool,
}

impl RunContext {
    /// Fresh context with paths under `guest_tmp_dir`.
    pub fn new(guest_tmp_dir: &str) -> Self {
        let suffix = unique_suffix();
        let dir = guest_tmp_dir.trim_end_matches('/');
        Self {
            suffix,
            script_path: format!("{dir}/vmexec_script_{suffix}.sh"),
            output_path: format!("{dir}/vmexec_out_{suffix}.out"),
            pid: None,
            completion_deadline: None,
            staging_requested: false,
            launch_requested: false,
            process_finished: false,
        }
    }

    /// Start the completion clock for a process launched at `launched_at`.
    ///
    /// Only the first call takes effect.
    pub fn arm_completion_deadline(&mut self, launched_at: Instant, timeout: Duration) -> Instant {
        *self
            .completion_deadline
            .get_or_insert(launched_at + timeout)
    }

    /// A process was launched and not seen to finish.
    pub fn process_left_running(&self) -> bool {
        self.pid.is_some() && !self.process_finished
    }

    /// Guest paths that may exist and must be cleaned up, in deletion order.
    pub fn created_paths(&self) -> Vec<&str> {
        let mut paths = Vec::with_capacity(2);
        if self.staging_requested {
            paths.push(self.script_path.as_str());
        }
        if self.launch_requested {
            paths.push(self.output_path.as_str());
        }
        paths
    }
}
