//! vSphere Automation REST client.
//!
//! [`Session`] handles login, logout and inventory lookups; [`VsphereGuest`]
//! implements [`GuestOperations`](crate::guest::GuestOperations) for one VM on
//! top of a session.

mod guest;
mod session;

pub use guest::VsphereGuest;
pub use session::{SESSION_HEADER, Session};

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use vmexec_common::ErrorCode;

/// Request timeout for management API calls.
pub const API_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(180);

/// Errors from session-level calls.
#[derive(Debug, Error)]
pub enum VsphereError {
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("cannot reach {endpoint}: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("login rejected (HTTP {status}): {message}")]
    Login { status: u16, message: String },

    #[error("{operation} failed (HTTP {status}): {message}")]
    Api {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("unexpected {operation} response: {reason}")]
    Decode {
        operation: &'static str,
        reason: String,
    },

    #[error("datacenter '{0}' not found")]
    DatacenterNotFound(String),

    #[error("VM '{0}' not found")]
    VmNotFound(String),
}

impl VsphereError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidEndpoint(_) => ErrorCode::ConfigEnvError,
            Self::Client(_) | Self::Unreachable { .. } => ErrorCode::AuthEndpointUnreachable,
            Self::Login { .. } | Self::Api { .. } | Self::Decode { .. } => {
                ErrorCode::AuthSessionFailed
            }
            Self::DatacenterNotFound(_) => ErrorCode::ConfigDatacenterNotFound,
            Self::VmNotFound(_) => ErrorCode::ConfigVmNotFound,
        }
    }
}

/// Managed object id of a VM, e.g. `vm-42`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRef {
    pub id: String,
    pub name: String,
}

/// HTTPS endpoint URL for `host` (`host` or `host:port`, no scheme).
///
/// An explicit `http://` or `https://` scheme is kept as given.
pub fn endpoint_url(host: &str) -> Result<Url, VsphereError> {
    let host = host.trim().trim_end_matches('/');
    if host.is_empty() {
        return Err(VsphereError::InvalidEndpoint(host.to_string()));
    }
    let with_scheme = if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}/")
    } else {
        format!("https://{host}/")
    };
    let url = Url::parse(&with_scheme).map_err(|_| VsphereError::InvalidEndpoint(host.to_string()))?;
    if url.host_str().is_none() || url.path() != "/" {
        return Err(VsphereError::InvalidEndpoint(host.to_string()));
    }
    Ok(url)
}

/// Error body of the Automation API.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    default_message: String,
}

/// Readable message and error type from an error response body.
fn describe_error_body(body: &str) -> (String, Option<String>) {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => {
            let message = parsed
                .messages
                .iter()
                .map(|m| m.default_message.as_str())
                .filter(|m| !m.is_empty())
                .collect::<Vec<_>>()
                .join("; ");
            let message = if message.is_empty() {
                parsed.error_type.clone().unwrap_or_default()
            } else {
                message
            };
            (message, parsed.error_type)
        }
        Err(_) => {
            let mut snippet: String = body.trim().chars().take(512).collect();
            if snippet.is_empty() {
                snippet = "empty response".to_string();
            }
            (snippet, None)
        }
    }
}
