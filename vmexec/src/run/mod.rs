//! The remote execution pipeline.
//!
//! A run moves through fixed stages: credential validation, script staging,
//! launch, completion polling, output retrieval and cleanup. Each stage lives
//! in its own module; [`Orchestrator`] drives them for one [`RunRequest`] and
//! guarantees cleanup of whatever was created on the guest.
//!
//! [`RunRequest`]: vmexec_common::RunRequest

pub mod cleanup;
pub mod context;
pub mod launch;
pub mod orchestrator;
pub mod poll;
pub mod retrieve;
pub mod stage;
pub mod validate;

pub use cleanup::{CleanupEntry, CleanupOutcome, CleanupReport};
pub use context::{RunContext, unique_suffix};
pub use orchestrator::Orchestrator;

use crate::guest::GuestOpsError;
use crate::transfer::TransferError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vmexec_common::config::RunSettings;
use vmexec_common::{ErrorCode, PosixFileAttributes, ProcessId, VmTarget};

/// Default interpreter for the launch command.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Tuning for the pipeline.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub guest_tmp_dir: String,
    pub output_dir: PathBuf,
    pub shell: String,
    pub use_sudo: bool,
    pub file_attributes: PosixFileAttributes,
    pub poll_interval: Duration,
    pub completion_timeout: Duration,
    pub run_budget: Duration,
    pub cleanup_grace: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from(&RunSettings::default())
    }
}

impl From<&RunSettings> for RunConfig {
    fn from(settings: &RunSettings) -> Self {
        Self {
            guest_tmp_dir: settings.guest_tmp_dir.clone(),
            output_dir: settings.output_dir.value.clone(),
            shell: DEFAULT_SHELL.to_string(),
            use_sudo: settings.use_sudo,
            file_attributes: PosixFileAttributes::default(),
            poll_interval: settings.poll_interval,
            completion_timeout: settings.completion_timeout.value,
            run_budget: settings.run_budget.value,
            cleanup_grace: settings.cleanup_grace,
        }
    }
}

impl RunConfig {
    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), RunError> {
        let mut problems = Vec::new();
        if self.poll_interval.is_zero() {
            problems.push("poll interval must be positive");
        }
        if self.completion_timeout.is_zero() {
            problems.push("completion timeout must be positive");
        }
        if self.run_budget.is_zero() {
            problems.push("run budget must be positive");
        }
        if self.cleanup_grace.is_zero() {
            problems.push("cleanup grace period must be positive");
        }
        if self.guest_tmp_dir.trim().is_empty() {
            problems.push("guest temp directory is empty");
        }
        if self.shell.trim().is_empty() {
            problems.push("shell is empty");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RunError::Config(problems.join("; ")))
        }
    }
}

/// Pipeline stage, used to report where a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Validate,
    Stage,
    Launch,
    Poll,
    Retrieve,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "credential validation",
            Self::Stage => "script staging",
            Self::Launch => "process launch",
            Self::Poll => "completion polling",
            Self::Retrieve => "output retrieval",
        };
        f.write_str(name)
    }
}

/// Failure of a transfer stage: either the guest API or the byte transfer.
#[derive(Debug, Error)]
pub enum TransferStepError {
    #[error(transparent)]
    Guest(#[from] GuestOpsError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Fatal run errors.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid run configuration: {0}")]
    Config(String),

    #[error("failed to read script {path}: {source}")]
    ScriptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential validation failed: {0}")]
    Auth(#[source] GuestOpsError),

    #[error("staging script to {path} failed: {source}")]
    Staging {
        path: String,
        #[source]
        source: TransferStepError,
    },

    #[error("launching {path} failed: {source}")]
    Launch {
        path: String,
        #[source]
        source: GuestOpsError,
    },

    #[error("polling process {pid} failed: {source}")]
    Poll {
        pid: ProcessId,
        #[source]
        source: GuestOpsError,
    },

    #[error("retrieving output {path} failed: {source}")]
    Retrieval {
        path: String,
        #[source]
        source: TransferStepError,
    },

    #[error("run cancelled during {stage}")]
    Cancelled { stage: RunStage },

    #[error("run budget of {}s exceeded during {stage}", .budget.as_secs())]
    BudgetExceeded { stage: RunStage, budget: Duration },
}

impl RunError {
    /// Catalog code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::ConfigEnvError,
            Self::ScriptRead { .. } => ErrorCode::ConfigScriptUnreadable,
            Self::Auth(GuestOpsError::Transport { .. }) => ErrorCode::AuthEndpointUnreachable,
            Self::Auth(_) => ErrorCode::AuthGuestRejected,
            Self::Staging { source, .. } => match source {
                TransferStepError::Guest(GuestOpsError::BadTransferUrl { .. }) => {
                    ErrorCode::TransferBadUrl
                }
                TransferStepError::Guest(_) => ErrorCode::TransferInitiateUpload,
                TransferStepError::Transfer(TransferError::LocalWrite { .. }) => {
                    ErrorCode::TransferLocalWrite
                }
                TransferStepError::Transfer(_) => ErrorCode::TransferUploadFailed,
            },
            Self::Launch { .. } => ErrorCode::GuestStartFailed,
            Self::Poll { .. } => ErrorCode::GuestListFailed,
            Self::Retrieval { source, .. } => match source {
                TransferStepError::Guest(GuestOpsError::BadTransferUrl { .. }) => {
                    ErrorCode::TransferBadUrl
                }
                TransferStepError::Guest(_) => ErrorCode::TransferInitiateDownload,
                TransferStepError::Transfer(TransferError::LocalWrite { .. }) => {
                    ErrorCode::TransferLocalWrite
                }
                TransferStepError::Transfer(_) => ErrorCode::TransferDownloadFailed,
            },
            Self::Cancelled { .. } => ErrorCode::RunCancelled,
            Self::BudgetExceeded { .. } => ErrorCode::RunBudgetExceeded,
        }
    }

    /// Failed before anything was created on the guest.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::ScriptRead { .. } | Self::Auth(_)
        )
    }
}

/// How the guest process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunOutcome {
    Completed { exit_code: i32 },
    /// No completion observed before the completion deadline. The process
    /// may still be running and the retrieved output may be partial.
    TimedOut,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { exit_code } => write!(f, "completed (exit {exit_code})"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Exit status used by the CLI for a timed-out run.
pub const TIMED_OUT_EXIT_STATUS: i32 = 124;

/// Result of a run that reached retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub target: VmTarget,
    pub outcome: RunOutcome,
    pub output_path: PathBuf,
    pub output_bytes: u64,
    pub uploaded_bytes: u64,
    pub pid: ProcessId,
    /// Parsed from the trailing `EXIT:<code>` line, absent on partial output.
    pub script_exit_code: Option<i32>,
    pub elapsed: Duration,
    pub cleanup: CleanupReport,
}

impl RunReport {
    /// Process exit status the CLI should return.
    pub fn exit_status(&self) -> i32 {
        match self.outcome {
            RunOutcome::TimedOut => TIMED_OUT_EXIT_STATUS,
            RunOutcome::Completed { exit_code } => self.script_exit_code.unwrap_or(exit_code),
        }
    }
}

/// A run that ended in a [`RunError`].
#[derive(Debug)]
pub struct RunFailure {
    pub error: RunError,
    pub cleanup: CleanupReport,
    /// A guest process was launched and not seen to finish.
    pub process_left_running: bool,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error.code().code_string(), self.error)
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<RunError> for RunFailure {
    fn from(error: RunError) -> Self {
        Self {
            error,
            cleanup: CleanupReport::default(),
            process_left_running: false,
        }
    }
}

/// Read the script payload once, before anything touches the guest.
pub async fn read_script(path: &Path) -> Result<Vec<u8>, RunError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| RunError::ScriptRead {
            path: path.to_path_buf(),
            source,
        })
}
