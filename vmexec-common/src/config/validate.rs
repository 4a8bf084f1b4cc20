//! Startup validation of resolved settings.
//!
//! Hard errors are raised while parsing; this pass only reports combinations
//! that are legal but probably not what the operator intended.

use super::settings::Settings;
use serde::Serialize;
use std::fmt;

/// Severity of a configuration warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A non-fatal finding about the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigWarning {
    pub severity: Severity,
    pub field: String,
    pub message: String,
}

impl ConfigWarning {
    fn new(severity: Severity, field: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Check settings for suspicious combinations.
pub fn validate_config(settings: &Settings) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();
    let run = &settings.run;

    if run.completion_timeout.value >= run.run_budget.value {
        warnings.push(ConfigWarning::new(
            Severity::Warning,
            "completion_timeout",
            format!(
                "completion timeout ({}s, from {}) is not shorter than the run budget ({}s, from {}); \
                 the budget will end the run before a timeout can be reported",
                run.completion_timeout.value.as_secs(),
                run.completion_timeout.describe(),
                run.run_budget.value.as_secs(),
                run.run_budget.describe(),
            ),
        ));
    }

    if run.poll_interval >= run.completion_timeout.value {
        warnings.push(ConfigWarning::new(
            Severity::Warning,
            "poll_interval",
            "poll interval is not shorter than the completion timeout; at most one poll will happen",
        ));
    }

    if settings.vcenter.insecure.value {
        warnings.push(ConfigWarning::new(
            Severity::Warning,
            "insecure",
            format!(
                "TLS certificate verification is disabled ({})",
                settings.vcenter.insecure.describe()
            ),
        ));
    }

    if !run.guest_tmp_dir.starts_with('/') {
        warnings.push(ConfigWarning::new(
            Severity::Warning,
            "guest_tmp_dir",
            format!("guest temp dir '{}' is not absolute", run.guest_tmp_dir),
        ));
    }

    if !run.use_sudo {
        warnings.push(ConfigWarning::new(
            Severity::Info,
            "use_sudo",
            "script will run without sudo as the guest user",
        ));
    }

    warnings
}
