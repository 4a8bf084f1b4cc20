//! Resolved runtime settings.
//!
//! The management endpoint, target VM and guest credentials keep the plain
//! variable names (`VCENTER_HOST`, `VM_NAME`, `GUEST_USER`, ...); tuning knobs
//! use the `VMEXEC_` prefix.

use super::dotenv::{DotEnv, DotenvError};
use super::env::{EnvError, EnvParser};
use super::source::Sourced;
use crate::errors::ErrorCode;
use crate::types::{GuestCredentials, VmTarget};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RUN_BUDGET_SECS: u64 = 600;
pub const DEFAULT_CLEANUP_GRACE_SECS: u64 = 30;
pub const DEFAULT_SCRIPT_PATH: &str = "script.sh";
pub const DEFAULT_GUEST_TMP_DIR: &str = "/tmp";

/// Errors raised while resolving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("invalid configuration: {}", format_env_errors(.0))]
    Invalid(Vec<EnvError>),

    #[error(transparent)]
    Dotenv(#[from] DotenvError),
}

impl ConfigError {
    /// Catalog code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Missing(_) => ErrorCode::ConfigMissingVar,
            Self::Invalid(_) => ErrorCode::ConfigEnvError,
            Self::Dotenv(_) => ErrorCode::ConfigDotenvError,
        }
    }
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Management endpoint settings.
#[derive(Clone)]
pub struct VcenterSettings {
    /// `host` or `host:port`, without scheme.
    pub host: Sourced<String>,
    pub user: String,
    pub password: String,
    /// Accept invalid TLS certificates.
    pub insecure: Sourced<bool>,
    pub datacenter: Option<String>,
}

impl fmt::Debug for VcenterSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VcenterSettings")
            .field("host", &self.host.value)
            .field("user", &self.user)
            .field("password", &"***")
            .field("insecure", &self.insecure.value)
            .field("datacenter", &self.datacenter)
            .finish()
    }
}

/// Tuning for a single run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub script_path: Sourced<PathBuf>,
    pub output_dir: Sourced<PathBuf>,
    pub guest_tmp_dir: String,
    pub poll_interval: Duration,
    pub completion_timeout: Sourced<Duration>,
    pub run_budget: Sourced<Duration>,
    pub cleanup_grace: Duration,
    pub use_sudo: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            script_path: Sourced::default_value(PathBuf::from(DEFAULT_SCRIPT_PATH)),
            output_dir: Sourced::default_value(PathBuf::from(".")),
            guest_tmp_dir: DEFAULT_GUEST_TMP_DIR.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            completion_timeout: Sourced::default_value(Duration::from_secs(
                DEFAULT_COMPLETION_TIMEOUT_SECS,
            )),
            run_budget: Sourced::default_value(Duration::from_secs(DEFAULT_RUN_BUDGET_SECS)),
            cleanup_grace: Duration::from_secs(DEFAULT_CLEANUP_GRACE_SECS),
            use_sudo: true,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

/// Everything the CLI needs to perform a run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub vcenter: VcenterSettings,
    pub target: Sourced<VmTarget>,
    pub guest: GuestCredentials,
    pub run: RunSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Resolve settings from the process environment and `./.env`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_dotenv(Path::new(".env"))
    }

    /// Resolve settings from the process environment and the given `.env` path.
    pub fn load_with_dotenv(path: &Path) -> Result<Self, ConfigError> {
        let dotenv = DotEnv::load(path)?;
        Self::resolve(
            EnvParser::with_prefix("").with_dotenv(dotenv.clone()),
            EnvParser::new().with_dotenv(dotenv),
        )
    }

    /// Resolve settings from `.env` content only, ignoring the process
    /// environment.
    pub fn from_dotenv(dotenv: DotEnv) -> Result<Self, ConfigError> {
        Self::resolve(
            EnvParser::with_prefix("")
                .with_dotenv(dotenv.clone())
                .without_process_env(),
            EnvParser::new().with_dotenv(dotenv).without_process_env(),
        )
    }

    fn resolve(mut plain: EnvParser, mut tuning: EnvParser) -> Result<Self, ConfigError> {
        let host = plain.require_string("VCENTER_HOST");
        let user = plain.require_string("VCENTER_USER");
        let password = plain.require_string("VCENTER_PASS");
        let insecure = plain.get_bool("VCENTER_INSECURE", false);
        let datacenter = plain.get_optional_string("VCENTER_DATACENTER");
        let target = plain.require_string("VM_NAME");
        let guest_user = plain.require_string("GUEST_USER");
        let guest_pass = plain.require_string("GUEST_PASS");

        let script_path = tuning.get_path("SCRIPT", DEFAULT_SCRIPT_PATH);
        let output_dir = tuning.get_path("OUTPUT_DIR", ".");
        let guest_tmp_dir = tuning.get_string("GUEST_TMP_DIR", DEFAULT_GUEST_TMP_DIR);
        let poll_ms = tuning.get_u64_range("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS, 50, 60_000);
        let completion = tuning.get_u64_range(
            "COMPLETION_TIMEOUT_SECS",
            DEFAULT_COMPLETION_TIMEOUT_SECS,
            1,
            86_400,
        );
        let budget = tuning.get_u64_range("RUN_BUDGET_SECS", DEFAULT_RUN_BUDGET_SECS, 1, 86_400);
        let grace = tuning.get_u64_range("CLEANUP_GRACE_SECS", DEFAULT_CLEANUP_GRACE_SECS, 1, 600);
        let use_sudo = tuning.get_bool("USE_SUDO", true);
        let log_level = tuning.get_log_level("LOG_LEVEL", "info");
        let log_format = tuning.get_string("LOG_FORMAT", "pretty");

        let mut errors = plain.take_errors();
        errors.extend(tuning.take_errors());

        let json = match log_format.value.to_lowercase().as_str() {
            "pretty" | "text" => false,
            "json" => true,
            other => {
                errors.push(EnvError::InvalidValue {
                    var: "VMEXEC_LOG_FORMAT".to_string(),
                    expected: "pretty or json".to_string(),
                    value: other.to_string(),
                });
                false
            }
        };

        let (missing, invalid): (Vec<_>, Vec<_>) = errors
            .into_iter()
            .partition(|err| matches!(err, EnvError::Missing { .. }));
        if !missing.is_empty() {
            return Err(ConfigError::Missing(
                missing
                    .into_iter()
                    .filter_map(|err| match err {
                        EnvError::Missing { var } => Some(var),
                        _ => None,
                    })
                    .collect(),
            ));
        }
        if !invalid.is_empty() {
            return Err(ConfigError::Invalid(invalid));
        }

        Ok(Self {
            vcenter: VcenterSettings {
                host,
                user: user.value,
                password: password.value,
                insecure,
                datacenter: datacenter.value,
            },
            target: target.map(VmTarget::new),
            guest: GuestCredentials::new(guest_user.value, guest_pass.value),
            run: RunSettings {
                script_path,
                output_dir,
                guest_tmp_dir: guest_tmp_dir.value,
                poll_interval: Duration::from_millis(poll_ms.value),
                completion_timeout: completion.map(Duration::from_secs),
                run_budget: budget.map(Duration::from_secs),
                cleanup_grace: Duration::from_secs(grace.value),
                use_sudo: use_sudo.value,
            },
            log: LogSettings {
                level: log_level.value,
                json,
            },
        })
    }
}
