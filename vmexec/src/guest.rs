//! Guest-operations contract consumed by the run pipeline.
//!
//! The pipeline never talks to the management API directly. Everything it
//! needs from the hypervisor goes through [`GuestOperations`], implemented by
//! [`crate::vsphere::VsphereGuest`] in production and
//! [`crate::mock::MockGuest`] in tests.

use crate::transfer::InvalidTransferUrl;
use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;
use vmexec_common::{GuestCredentials, PosixFileAttributes, ProcessId, ProcessInfo};

/// Raw transfer URL as issued by the guest-operations API.
///
/// It may be relative or carry the `*` host placeholder; resolve it with
/// [`GuestOperations::resolve_transfer_url`] before use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHandle(pub String);

impl TransferHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Errors reported by a guest-operations implementation.
#[derive(Debug, Error)]
pub enum GuestOpsError {
    /// The guest rejected the supplied credentials.
    #[error("guest authentication failed: {0}")]
    Auth(String),

    /// The API answered with an error.
    #[error("{operation} failed{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Api {
        operation: &'static str,
        status: Option<u16>,
        message: String,
    },

    /// The request never got an answer.
    #[error("{operation} request failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The API answered with something we could not interpret.
    #[error("unexpected {operation} response: {reason}")]
    Decode {
        operation: &'static str,
        reason: String,
    },

    /// A transfer handle could not be turned into an absolute URL.
    #[error("invalid transfer URL '{url}': {reason}")]
    BadTransferUrl { url: String, reason: String },
}

impl From<InvalidTransferUrl> for GuestOpsError {
    fn from(e: InvalidTransferUrl) -> Self {
        Self::BadTransferUrl {
            url: e.url,
            reason: e.reason,
        }
    }
}

impl GuestOpsError {
    pub fn api(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Api {
            operation,
            status: None,
            message: message.into(),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Operations against the guest OS of one VM.
///
/// Every call carries the guest credentials explicitly; implementations keep
/// no per-run state.
#[async_trait]
pub trait GuestOperations: Send + Sync {
    /// Check that `auth` is accepted by the guest without side effects.
    async fn validate_credentials(&self, auth: &GuestCredentials) -> Result<(), GuestOpsError>;

    /// Ask for an upload URL for `path`, declaring the final size in bytes.
    async fn initiate_upload(
        &self,
        auth: &GuestCredentials,
        path: &str,
        attrs: &PosixFileAttributes,
        size: u64,
        overwrite: bool,
    ) -> Result<TransferHandle, GuestOpsError>;

    /// Ask for a download URL for `path`.
    async fn initiate_download(
        &self,
        auth: &GuestCredentials,
        path: &str,
    ) -> Result<TransferHandle, GuestOpsError>;

    /// Turn a transfer handle into an absolute URL reachable from this host.
    fn resolve_transfer_url(&self, handle: &TransferHandle) -> Result<Url, GuestOpsError>;

    /// Start `program` with `arguments` (one shell-style string) and return its pid.
    async fn start_process(
        &self,
        auth: &GuestCredentials,
        program: &str,
        arguments: &str,
    ) -> Result<ProcessId, GuestOpsError>;

    /// Report the state of the given processes. Unknown pids are omitted.
    async fn list_process_status(
        &self,
        auth: &GuestCredentials,
        pids: &[ProcessId],
    ) -> Result<Vec<ProcessInfo>, GuestOpsError>;

    /// Delete a guest file.
    async fn delete_file(&self, auth: &GuestCredentials, path: &str) -> Result<(), GuestOpsError>;
}
