//! Error catalog for vmexec.
//!
//! Every failure a run can end in has a stable code in the `VMX-Exxx` format,
//! a message, and remediation steps that the CLI prints on fatal errors.
//!
//! # Error Code Ranges
//!
//! | Range      | Category  | Description                                   |
//! |------------|-----------|-----------------------------------------------|
//! | E001-E099  | Config    | Configuration and local input errors          |
//! | E100-E199  | Auth      | Management session and guest credential errors|
//! | E200-E299  | Transfer  | Guest file upload/download errors             |
//! | E300-E399  | Guest     | Guest operations (process, file) errors       |
//! | E400-E499  | Run       | Run lifecycle errors (timeout, cancellation)  |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all vmexec error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Required environment variable is missing
    ConfigMissingVar,
    /// Environment variable has an invalid value
    ConfigEnvError,
    /// The .env file could not be read
    ConfigDotenvError,
    /// The local script could not be read
    ConfigScriptUnreadable,
    /// Target VM was not found in the inventory
    ConfigVmNotFound,
    /// Datacenter was not found in the inventory
    ConfigDatacenterNotFound,

    // =========================================================================
    // Auth Errors (E100-E199)
    // =========================================================================
    /// Management endpoint rejected the login
    AuthSessionFailed,
    /// Guest credentials were rejected
    AuthGuestRejected,
    /// Management endpoint unreachable
    AuthEndpointUnreachable,

    // =========================================================================
    // Transfer Errors (E200-E299)
    // =========================================================================
    /// Upload transfer handle could not be obtained
    TransferInitiateUpload,
    /// Script upload returned a non-success status
    TransferUploadFailed,
    /// Download transfer handle could not be obtained
    TransferInitiateDownload,
    /// Output download returned a non-success status
    TransferDownloadFailed,
    /// Transfer URL could not be resolved
    TransferBadUrl,
    /// Local output file could not be written
    TransferLocalWrite,

    // =========================================================================
    // Guest Errors (E300-E399)
    // =========================================================================
    /// Guest process could not be started
    GuestStartFailed,
    /// Guest process listing failed
    GuestListFailed,
    /// Guest file deletion failed
    GuestDeleteFailed,

    // =========================================================================
    // Run Errors (E400-E499)
    // =========================================================================
    /// Process did not report completion before the completion deadline
    RunCompletionTimeout,
    /// Overall run budget was exhausted
    RunBudgetExceeded,
    /// Run was cancelled by the caller
    RunCancelled,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            // Config (001-099)
            Self::ConfigMissingVar => 1,
            Self::ConfigEnvError => 2,
            Self::ConfigDotenvError => 3,
            Self::ConfigScriptUnreadable => 4,
            Self::ConfigVmNotFound => 5,
            Self::ConfigDatacenterNotFound => 6,

            // Auth (100-199)
            Self::AuthSessionFailed => 100,
            Self::AuthGuestRejected => 101,
            Self::AuthEndpointUnreachable => 102,

            // Transfer (200-299)
            Self::TransferInitiateUpload => 200,
            Self::TransferUploadFailed => 201,
            Self::TransferInitiateDownload => 202,
            Self::TransferDownloadFailed => 203,
            Self::TransferBadUrl => 204,
            Self::TransferLocalWrite => 205,

            // Guest (300-399)
            Self::GuestStartFailed => 300,
            Self::GuestListFailed => 301,
            Self::GuestDeleteFailed => 302,

            // Run (400-499)
            Self::RunCompletionTimeout => 400,
            Self::RunBudgetExceeded => 401,
            Self::RunCancelled => 402,
        }
    }

    /// Returns the formatted error code string (e.g., "VMX-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("VMX-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Auth,
            200..=299 => ErrorCategory::Transfer,
            300..=399 => ErrorCategory::Guest,
            _ => ErrorCategory::Run,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigMissingVar => "Required environment variable is not set",
            Self::ConfigEnvError => "Environment variable has invalid value",
            Self::ConfigDotenvError => "Failed to read .env file",
            Self::ConfigScriptUnreadable => "Script file could not be read",
            Self::ConfigVmNotFound => "Virtual machine not found",
            Self::ConfigDatacenterNotFound => "Datacenter not found",

            Self::AuthSessionFailed => "Management endpoint rejected the login",
            Self::AuthGuestRejected => "Guest credentials were rejected",
            Self::AuthEndpointUnreachable => "Management endpoint is unreachable",

            Self::TransferInitiateUpload => "Could not obtain an upload URL from the guest",
            Self::TransferUploadFailed => "Script upload to the guest failed",
            Self::TransferInitiateDownload => "Could not obtain a download URL from the guest",
            Self::TransferDownloadFailed => "Output download from the guest failed",
            Self::TransferBadUrl => "Transfer URL could not be resolved",
            Self::TransferLocalWrite => "Failed to write the local output file",

            Self::GuestStartFailed => "Guest process could not be started",
            Self::GuestListFailed => "Guest process status could not be queried",
            Self::GuestDeleteFailed => "Guest temporary file could not be deleted",

            Self::RunCompletionTimeout => "Guest process did not finish before the deadline",
            Self::RunBudgetExceeded => "Run exceeded its overall time budget",
            Self::RunCancelled => "Run was cancelled",
        }
    }

    /// Returns remediation steps for this error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigMissingVar => &[
                "Export the variable or add it to a .env file in the working directory",
                "Required: VCENTER_HOST, VCENTER_USER, VCENTER_PASS, VM_NAME, GUEST_USER, GUEST_PASS",
            ],
            Self::ConfigEnvError => &[
                "Check the value against the documented range",
                "Unset the variable to fall back to the default",
            ],
            Self::ConfigDotenvError => &["Check permissions of .env", "Remove the file if unused"],
            Self::ConfigScriptUnreadable => &[
                "Check that the script path exists (default: script.sh)",
                "Pass --script or set VMEXEC_SCRIPT",
            ],
            Self::ConfigVmNotFound => &[
                "Check VM_NAME matches the inventory name exactly",
                "Set VCENTER_DATACENTER if several datacenters exist",
            ],
            Self::ConfigDatacenterNotFound => &["Check VCENTER_DATACENTER"],
            Self::AuthSessionFailed => &[
                "Check VCENTER_USER and VCENTER_PASS",
                "Verify the account is not locked",
            ],
            Self::AuthGuestRejected => &[
                "Check GUEST_USER and GUEST_PASS",
                "Verify VMware Tools is running in the guest",
            ],
            Self::AuthEndpointUnreachable => &[
                "Check VCENTER_HOST and network connectivity",
                "Set VCENTER_INSECURE=true for self-signed certificates",
            ],
            Self::TransferInitiateUpload | Self::TransferInitiateDownload => &[
                "Verify VMware Tools is running in the guest",
                "Check the guest temp directory exists and is writable",
            ],
            Self::TransferUploadFailed | Self::TransferDownloadFailed => &[
                "Check that the ESXi host serving the transfer URL is reachable",
                "Retry the run; transfer URLs are single-use",
            ],
            Self::TransferBadUrl => &["Check VCENTER_HOST is a plain host[:port]"],
            Self::TransferLocalWrite => &["Check the output directory exists and is writable"],
            Self::GuestStartFailed => &[
                "Check /bin/bash exists in the guest",
                "Verify the guest user may run programs",
            ],
            Self::GuestListFailed => &["Verify VMware Tools is still running in the guest"],
            Self::GuestDeleteFailed => &["Remove the leftover files in the guest temp directory"],
            Self::RunCompletionTimeout => &[
                "Raise VMEXEC_COMPLETION_TIMEOUT_SECS",
                "The guest process was left running; check it manually",
            ],
            Self::RunBudgetExceeded => &["Raise VMEXEC_RUN_BUDGET_SECS"],
            Self::RunCancelled => &["The guest process may still be running; check it manually"],
        }
    }

    /// Returns all error codes for iteration.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigMissingVar,
            Self::ConfigEnvError,
            Self::ConfigDotenvError,
            Self::ConfigScriptUnreadable,
            Self::ConfigVmNotFound,
            Self::ConfigDatacenterNotFound,
            Self::AuthSessionFailed,
            Self::AuthGuestRejected,
            Self::AuthEndpointUnreachable,
            Self::TransferInitiateUpload,
            Self::TransferUploadFailed,
            Self::TransferInitiateDownload,
            Self::TransferDownloadFailed,
            Self::TransferBadUrl,
            Self::TransferLocalWrite,
            Self::GuestStartFailed,
            Self::GuestListFailed,
            Self::GuestDeleteFailed,
            Self::RunCompletionTimeout,
            Self::RunBudgetExceeded,
            Self::RunCancelled,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration and local input errors (E001-E099)
    Config,
    /// Session and credential errors (E100-E199)
    Auth,
    /// Guest file transfer errors (E200-E299)
    Transfer,
    /// Guest operation errors (E300-E399)
    Guest,
    /// Run lifecycle errors (E400-E499)
    Run,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Auth => "Authentication",
            Self::Transfer => "Transfer",
            Self::Guest => "Guest",
            Self::Run => "Run",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "VMX-E001")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}
