//! Completion polling for a launched guest process.

use crate::guest::{GuestOperations, GuestOpsError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use vmexec_common::{GuestCredentials, ProcessId, ProcessStatus};

/// Timing for one polling session.
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub interval: Duration,
    /// Launch time plus the completion timeout.
    pub completion_deadline: Instant,
    /// End of the overall run budget.
    pub budget_deadline: Instant,
}

impl PollSchedule {
    /// The earlier of the two deadlines.
    pub fn effective_deadline(&self) -> Instant {
        self.completion_deadline.min(self.budget_deadline)
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Guest(#[from] GuestOpsError),

    #[error("polling cancelled")]
    Cancelled,

    #[error("run budget exhausted while polling")]
    BudgetExceeded,
}

/// Poll until `pid` reports an end time or a deadline passes.
///
/// The first query is sent immediately. Returns `Completed` or `TimedOut`;
/// the remote process is left alone on timeout. Listing errors are fatal, an
/// empty listing is treated as not-yet-visible and polling continues.
pub async fn wait_for_completion<G>(
    guest: &G,
    auth: &GuestCredentials,
    pid: ProcessId,
    schedule: PollSchedule,
    cancel: &CancellationToken,
) -> Result<ProcessStatus, PollError>
where
    G: GuestOperations + ?Sized,
{
    let mut ticker = interval(schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PollError::Cancelled),
        result = poll_until_finished(guest, auth, pid, &mut ticker) => result.map_err(PollError::from),
        _ = sleep_until(schedule.effective_deadline()) => {
            if schedule.completion_deadline <= schedule.budget_deadline {
                warn!(%pid, "process did not finish before the completion deadline");
                Ok(ProcessStatus::TimedOut)
            } else {
                Err(PollError::BudgetExceeded)
            }
        }
    }
}

async fn poll_until_finished<G>(
    guest: &G,
    auth: &GuestCredentials,
    pid: ProcessId,
    ticker: &mut Interval,
) -> Result<ProcessStatus, GuestOpsError>
where
    G: GuestOperations + ?Sized,
{
    let mut polls = 0u32;
    loop {
        ticker.tick().await;
        polls += 1;
        let listing = guest.list_process_status(auth, &[pid]).await?;
        match ProcessStatus::from_listing(pid, &listing) {
            status @ ProcessStatus::Completed { .. } => {
                debug!(%pid, polls, "process finished");
                return Ok(status);
            }
            ProcessStatus::Unknown => debug!(%pid, polls, "process not in listing yet"),
            status => trace!(%pid, polls, %status, "still waiting"),
        }
    }
}
