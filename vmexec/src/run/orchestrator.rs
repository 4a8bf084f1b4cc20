//! Drives one run through every stage and always cleans up.

use super::cleanup::cleanup_paths;
use super::context::RunContext;
use super::launch::{build_launch_command, launch_script};
use super::poll::{PollError, PollSchedule, wait_for_completion};
use super::retrieve::{output_file_path, read_exit_marker, retrieve_output};
use super::stage::stage_script;
use super::validate::validate_credentials;
use super::{RunConfig, RunError, RunFailure, RunOutcome, RunReport, RunStage};
use crate::guest::GuestOperations;
use crate::transfer::Transfer;
use std::future::Future;
use std::path::PathBuf;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use vmexec_common::util::humanize_duration;
use vmexec_common::{ProcessId, ProcessStatus, RunRequest};

/// What a successful pass through the stages produced.
struct Driven {
    uploaded_bytes: u64,
    pid: ProcessId,
    outcome: RunOutcome,
    output_path: PathBuf,
    output_bytes: u64,
    script_exit_code: Option<i32>,
}

/// Runs scripts against one guest with an explicit session handle.
///
/// The orchestrator borrows the guest-operations and transfer handles; it
/// never creates or shares sessions itself.
pub struct Orchestrator<'a, G: ?Sized, T: ?Sized> {
    guest: &'a G,
    transfer: &'a T,
    config: RunConfig,
    cancel: CancellationToken,
}

impl<'a, G, T> Orchestrator<'a, G, T>
where
    G: GuestOperations + ?Sized,
    T: Transfer + ?Sized,
{
    pub fn new(guest: &'a G, transfer: &'a T, config: RunConfig) -> Self {
        Self {
            guest,
            transfer,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop in-flight stages when `cancel` fires. Cleanup still runs.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute `request` end to end.
    ///
    /// Every guest path that may have been created is deleted afterwards,
    /// whatever the result. Cleanup problems only show up in the report.
    pub async fn run(&self, request: &RunRequest) -> Result<RunReport, RunFailure> {
        let span = info_span!("run", target = %request.target);
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: &RunRequest) -> Result<RunReport, RunFailure> {
        let started = Instant::now();
        self.config.validate()?;

        let budget_deadline = started + self.config.run_budget;
        let mut ctx = RunContext::new(&self.config.guest_tmp_dir);
        info!(
            script = %ctx.script_path,
            output = %ctx.output_path,
            bytes = request.script.len(),
            "starting run"
        );

        let result = self.drive(request, &mut ctx, budget_deadline).await;

        let cleanup = cleanup_paths(
            self.guest,
            &request.credentials,
            &ctx.created_paths(),
            Instant::now() + self.config.cleanup_grace,
        )
        .await;
        if !cleanup.is_empty() && cleanup.is_clean() {
            info!("guest cleanup complete");
        }

        let elapsed = started.elapsed();
        match result {
            Ok(driven) => {
                info!(
                    outcome = %driven.outcome,
                    elapsed = %humanize_duration(elapsed.as_secs()),
                    "run finished"
                );
                Ok(RunReport {
                    target: request.target.clone(),
                    outcome: driven.outcome,
                    output_path: driven.output_path,
                    output_bytes: driven.output_bytes,
                    uploaded_bytes: driven.uploaded_bytes,
                    pid: driven.pid,
                    script_exit_code: driven.script_exit_code,
                    elapsed,
                    cleanup,
                })
            }
            Err(error) => {
                let process_left_running = ctx.process_left_running();
                error!(
                    code = %error.code().code_string(),
                    error = %error,
                    process_left_running,
                    "run failed"
                );
                Err(RunFailure {
                    error,
                    cleanup,
                    process_left_running,
                })
            }
        }
    }

    async fn drive(
        &self,
        request: &RunRequest,
        ctx: &mut RunContext,
        budget_deadline: Instant,
    ) -> Result<Driven, RunError> {
        let auth = &request.credentials;

        self.guarded(
            RunStage::Validate,
            budget_deadline,
            validate_credentials(self.guest, auth),
        )
        .await?
        .map_err(RunError::Auth)?;

        ctx.staging_requested = true;
        let uploaded_bytes = self
            .guarded(
                RunStage::Stage,
                budget_deadline,
                stage_script(
                    self.guest,
                    self.transfer,
                    auth,
                    &ctx.script_path,
                    &self.config.file_attributes,
                    &request.script,
                ),
            )
            .await?
            .map_err(|source| RunError::Staging {
                path: ctx.script_path.clone(),
                source,
            })?;

        let command = build_launch_command(
            &self.config.shell,
            &ctx.script_path,
            &ctx.output_path,
            self.config.use_sudo,
        );
        ctx.launch_requested = true;
        let pid = self
            .guarded(
                RunStage::Launch,
                budget_deadline,
                launch_script(self.guest, auth, &command),
            )
            .await?
            .map_err(|source| RunError::Launch {
                path: ctx.script_path.clone(),
                source,
            })?;
        ctx.pid = Some(pid);

        let schedule = PollSchedule {
            interval: self.config.poll_interval,
            completion_deadline: ctx
                .arm_completion_deadline(Instant::now(), self.config.completion_timeout),
            budget_deadline,
        };
        let status = wait_for_completion(self.guest, auth, pid, schedule, &self.cancel)
            .await
            .map_err(|e| match e {
                PollError::Guest(source) => RunError::Poll { pid, source },
                PollError::Cancelled => RunError::Cancelled {
                    stage: RunStage::Poll,
                },
                PollError::BudgetExceeded => RunError::BudgetExceeded {
                    stage: RunStage::Poll,
                    budget: self.config.run_budget,
                },
            })?;

        let outcome = match status {
            ProcessStatus::Completed { exit_code } => {
                ctx.process_finished = true;
                info!(%pid, exit_code, "process completed");
                RunOutcome::Completed { exit_code }
            }
            _ => {
                warn!(%pid, "process timed out, retrieving partial output");
                RunOutcome::TimedOut
            }
        };

        let output_path = output_file_path(&self.config.output_dir, &request.target);
        let output_bytes = self
            .guarded(
                RunStage::Retrieve,
                budget_deadline,
                retrieve_output(
                    self.guest,
                    self.transfer,
                    auth,
                    &ctx.output_path,
                    &output_path,
                ),
            )
            .await?
            .map_err(|source| RunError::Retrieval {
                path: ctx.output_path.clone(),
                source,
            })?;
        let script_exit_code = read_exit_marker(&output_path).await;

        Ok(Driven {
            uploaded_bytes,
            pid,
            outcome,
            output_path,
            output_bytes,
            script_exit_code,
        })
    }

    /// Race `fut` against cancellation and the run budget.
    async fn guarded<F>(
        &self,
        stage: RunStage,
        budget_deadline: Instant,
        fut: F,
    ) -> Result<F::Output, RunError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RunError::Cancelled { stage }),
            _ = sleep_until(budget_deadline) => Err(RunError::BudgetExceeded {
                stage,
                budget: self.config.run_budget,
            }),
            output = fut => Ok(output),
        }
    }
}
