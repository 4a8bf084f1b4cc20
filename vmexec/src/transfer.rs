//! Byte transfer against guest file-transfer URLs.
//!
//! The guest-operations API only hands out short-lived URLs; the bytes
//! themselves move over plain HTTPS, which is what this module does.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use vmexec_common::util::redact_url_query;

/// Per-request timeout for transfers.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(180);

/// Maximum number of error-body bytes kept in a [`TransferError::Status`].
pub const ERROR_BODY_LIMIT: usize = 2048;

/// Errors from a byte transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("{operation} request failed: {source}")]
    Http {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("failed to write {path}: {source}")]
    LocalWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Rejected(String),
}

/// A transfer URL that could not be normalized.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid transfer URL '{url}': {reason}")]
pub struct InvalidTransferUrl {
    pub url: String,
    pub reason: String,
}

/// Moves bytes to and from transfer URLs.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// PUT `bytes` to `url`. Returns the number of bytes sent.
    async fn upload(&self, url: &Url, bytes: &[u8]) -> Result<u64, TransferError>;

    /// GET `url` into `dest`, replacing any existing file. Returns the number
    /// of bytes written. On error `dest` is left as it was.
    async fn download(&self, url: &Url, dest: &Path) -> Result<u64, TransferError>;
}

/// [`Transfer`] over HTTPS with reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: Client,
}

impl HttpTransfer {
    /// Build a client with the transfer timeout. `insecure` disables TLS
    /// certificate verification.
    pub fn new(insecure: bool) -> Result<Self, TransferError> {
        let client = Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(TransferError::Client)?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn upload(&self, url: &Url, bytes: &[u8]) -> Result<u64, TransferError> {
        debug!(url = %redact_url_query(url.as_str()), size = bytes.len(), "uploading");

        let response = self
            .client
            .put(url.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|source| TransferError::Http {
                operation: "upload",
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                operation: "upload",
                status: status.as_u16(),
                body: read_body_snippet(response).await,
            });
        }

        Ok(bytes.len() as u64)
    }

    async fn download(&self, url: &Url, dest: &Path) -> Result<u64, TransferError> {
        debug!(url = %redact_url_query(url.as_str()), dest = %dest.display(), "downloading");

        let mut response =
            self.client
                .get(url.clone())
                .send()
                .await
                .map_err(|source| TransferError::Http {
                    operation: "download",
                    source,
                })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(TransferError::Status {
                operation: "download",
                status: status.as_u16(),
                body: read_body_snippet(response).await,
            });
        }

        let local_write = |source: std::io::Error| TransferError::LocalWrite {
            path: dest.to_path_buf(),
            source,
        };
        // Body goes to a sibling temp file; `dest` is only replaced once the
        // whole body is on disk. Dropping `staging` removes the temp file.
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let staging = tempfile::Builder::new()
            .prefix(".vmexec-download-")
            .tempfile_in(dir)
            .map_err(local_write)?;
        let mut file = tokio::fs::File::from_std(staging.reopen().map_err(local_write)?);
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| TransferError::Http {
                operation: "download",
                source,
            })?
        {
            file.write_all(&chunk).await.map_err(local_write)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(local_write)?;
        drop(file);

        staging.persist(dest).map_err(|e| local_write(e.error))?;
        Ok(written)
    }
}

/// Read at most [`ERROR_BODY_LIMIT`] bytes of an error response.
async fn read_body_snippet(mut response: reqwest::Response) -> String {
    let mut body = Vec::new();
    while body.len() < ERROR_BODY_LIMIT {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            _ => break,
        }
    }
    body.truncate(ERROR_BODY_LIMIT);
    String::from_utf8_lossy(&body).trim().to_string()
}

/// Resolve a raw transfer URL against the management endpoint.
///
/// Relative URLs are joined onto `endpoint`. A `*` host (with or without its
/// own port) is replaced by the endpoint's host and port, since the hypervisor
/// host that issued the URL is only reachable through the endpoint.
pub fn normalize_transfer_url(endpoint: &Url, raw: &str) -> Result<Url, InvalidTransferUrl> {
    let invalid = |reason: String| InvalidTransferUrl {
        url: redact_url_query(raw),
        reason,
    };

    let raw = raw.trim();
    if raw.is_empty() {
        return Err(invalid("empty URL".to_string()));
    }

    let substituted = match split_placeholder_host(raw) {
        Some((scheme, rest)) => {
            let host = endpoint
                .host_str()
                .ok_or_else(|| invalid("endpoint has no host".to_string()))?;
            let authority = match endpoint.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            Some(format!("{scheme}://{authority}{rest}"))
        }
        None => None,
    };

    let url = endpoint
        .join(substituted.as_deref().unwrap_or(raw))
        .map_err(|e| invalid(e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    Ok(url)
}

/// For `scheme://*[:port]rest`, return `(scheme, rest)`.
fn split_placeholder_host(raw: &str) -> Option<(&str, &str)> {
    let (scheme, after) = raw.split_once("://")?;
    let rest = after.strip_prefix('*')?;
    let rest = match rest.strip_prefix(':') {
        Some(port_and_rest) => {
            let end = port_and_rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(port_and_rest.len());
            &port_and_rest[end..]
        }
        None => rest,
    };
    if rest.is_empty() || rest.starts_with(['/', '?', '#']) {
        Some((scheme, rest))
    } else {
        None
    }
}
