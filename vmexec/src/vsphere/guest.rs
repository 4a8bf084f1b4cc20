//! Guest operations for one VM over the Automation REST API.

use super::session::{SESSION_HEADER, Session, api_url};
use super::{VmRef, describe_error_body};
use crate::guest::{GuestOperations, GuestOpsError, TransferHandle};
use crate::transfer::normalize_transfer_url;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vmexec_common::util::mask_sensitive;
use vmexec_common::{GuestCredentials, PosixFileAttributes, ProcessId, ProcessInfo};

#[derive(Serialize)]
struct ApiCredentials<'a> {
    interactive_session: bool,
    #[serde(rename = "type")]
    kind: &'static str,
    user_name: &'a str,
    password: &'a str,
}

impl<'a> From<&'a GuestCredentials> for ApiCredentials<'a> {
    fn from(auth: &'a GuestCredentials) -> Self {
        Self {
            interactive_session: false,
            kind: "USERNAME_PASSWORD",
            user_name: &auth.username,
            password: &auth.password,
        }
    }
}

#[derive(Serialize)]
struct CredentialsOnly<'a> {
    credentials: ApiCredentials<'a>,
}

#[derive(Serialize)]
struct WithSpec<'a, S> {
    credentials: ApiCredentials<'a>,
    spec: S,
}

#[derive(Serialize)]
struct PosixAttributes {
    owner_id: u32,
    group_id: u32,
    permissions: String,
}

#[derive(Serialize)]
struct FileAttributes {
    overwrite: bool,
    size: u64,
    posix: PosixAttributes,
}

#[derive(Serialize)]
struct UploadSpec<'a> {
    path: &'a str,
    attributes: FileAttributes,
}

#[derive(Serialize)]
struct DownloadSpec<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct ProcessSpec<'a> {
    path: &'a str,
    arguments: &'a str,
}

#[derive(Debug, Deserialize)]
struct ProcessEntry {
    #[serde(default)]
    finished: Option<DateTime<Utc>>,
    #[serde(default)]
    exit_code: Option<i32>,
}

/// [`GuestOperations`] for one VM, borrowing an open [`Session`].
#[derive(Debug, Clone)]
pub struct VsphereGuest<'a> {
    session: &'a Session,
    vm: VmRef,
}

impl<'a> VsphereGuest<'a> {
    pub fn new(session: &'a Session, vm: VmRef) -> Self {
        Self { session, vm }
    }

    pub fn vm(&self) -> &VmRef {
        &self.vm
    }

    fn url(&self, tail: &[&str], action: &str) -> Result<Url, GuestOpsError> {
        let mut segments = vec!["api", "vcenter", "vm", self.vm.id.as_str(), "guest"];
        segments.extend_from_slice(tail);
        let mut url = api_url(self.session.endpoint(), &segments).map_err(|e| {
            GuestOpsError::Decode {
                operation: "build request URL",
                reason: e.to_string(),
            }
        })?;
        url.query_pairs_mut().append_pair("action", action);
        Ok(url)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        operation: &'static str,
        url: Url,
        body: &B,
        auth: &GuestCredentials,
    ) -> Result<Response, GuestOpsError> {
        let response = self
            .session
            .client()
            .post(url)
            .header(SESSION_HEADER, self.session.token())
            .json(body)
            .send()
            .await
            .map_err(|source| GuestOpsError::Transport { operation, source })?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(operation, response, auth).await)
        }
    }

    async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: Url,
        body: &B,
        auth: &GuestCredentials,
    ) -> Result<R, GuestOpsError> {
        let response = self.post(operation, url, body, auth).await?;
        response.json().await.map_err(|e| GuestOpsError::Decode {
            operation,
            reason: e.to_string(),
        })
    }
}

/// Map an error response, treating authentication failures separately.
async fn error_from_response(
    operation: &'static str,
    response: Response,
    auth: &GuestCredentials,
) -> GuestOpsError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let (message, error_type) = describe_error_body(&body);
    let message = mask_sensitive(&message, &[auth.password.as_str()]);

    let auth_failure = matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        || matches!(
            error_type.as_deref(),
            Some("UNAUTHENTICATED" | "UNAUTHORIZED")
        );
    if auth_failure {
        GuestOpsError::Auth(message)
    } else {
        GuestOpsError::Api {
            operation,
            status: Some(status.as_u16()),
            message,
        }
    }
}

/// Process ids come back as JSON numbers or strings depending on the release.
fn parse_pid(value: &serde_json::Value) -> Option<ProcessId> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().map(ProcessId),
        serde_json::Value::String(s) => s.trim().parse().ok().map(ProcessId),
        _ => None,
    }
}

#[async_trait]
impl GuestOperations for VsphereGuest<'_> {
    async fn validate_credentials(&self, auth: &GuestCredentials) -> Result<(), GuestOpsError> {
        let url = self.url(&["processes"], "list")?;
        let body = CredentialsOnly {
            credentials: auth.into(),
        };
        self.post("validate credentials", url, &body, auth).await?;
        Ok(())
    }

    async fn initiate_upload(
        &self,
        auth: &GuestCredentials,
        path: &str,
        attrs: &PosixFileAttributes,
        size: u64,
        overwrite: bool,
    ) -> Result<TransferHandle, GuestOpsError> {
        let url = self.url(&["filesystem"], "create")?;
        let body = WithSpec {
            credentials: auth.into(),
            spec: UploadSpec {
                path,
                attributes: FileAttributes {
                    overwrite,
                    size,
                    posix: PosixAttributes {
                        owner_id: attrs.owner_id,
                        group_id: attrs.group_id,
                        permissions: attrs.permissions_octal(),
                    },
                },
            },
        };
        let raw: String = self.post_json("initiate upload", url, &body, auth).await?;
        debug!(path, size, "upload handle issued");
        Ok(TransferHandle::new(raw))
    }

    async fn initiate_download(
        &self,
        auth: &GuestCredentials,
        path: &str,
    ) -> Result<TransferHandle, GuestOpsError> {
        let url = self.url(&["filesystem"], "create")?;
        let body = WithSpec {
            credentials: auth.into(),
            spec: DownloadSpec { path },
        };
        let raw: String = self.post_json("initiate download", url, &body, auth).await?;
        debug!(path, "download handle issued");
        Ok(TransferHandle::new(raw))
    }

    fn resolve_transfer_url(&self, handle: &TransferHandle) -> Result<Url, GuestOpsError> {
        normalize_transfer_url(self.session.endpoint(), handle.as_str()).map_err(GuestOpsError::from)
    }

    async fn start_process(
        &self,
        auth: &GuestCredentials,
        program: &str,
        arguments: &str,
    ) -> Result<ProcessId, GuestOpsError> {
        let url = self.url(&["processes"], "create")?;
        let body = WithSpec {
            credentials: auth.into(),
            spec: ProcessSpec {
                path: program,
                arguments,
            },
        };
        let value: serde_json::Value = self.post_json("start process", url, &body, auth).await?;
        parse_pid(&value).ok_or_else(|| GuestOpsError::Decode {
            operation: "start process",
            reason: format!("expected a process id, got {value}"),
        })
    }

    async fn list_process_status(
        &self,
        auth: &GuestCredentials,
        pids: &[ProcessId],
    ) -> Result<Vec<ProcessInfo>, GuestOpsError> {
        let mut listing = Vec::with_capacity(pids.len());
        for &pid in pids {
            let pid_segment = pid.to_string();
            let url = self.url(&["processes", pid_segment.as_str()], "get")?;
            let body = CredentialsOnly {
                credentials: auth.into(),
            };
            match self
                .post_json::<_, ProcessEntry>("get process", url, &body, auth)
                .await
            {
                Ok(entry) => listing.push(ProcessInfo {
                    pid,
                    end_time: entry.finished,
                    exit_code: entry.exit_code,
                }),
                Err(GuestOpsError::Api {
                    status: Some(404), ..
                }) => debug!(%pid, "process not listed"),
                Err(e) => return Err(e),
            }
        }
        Ok(listing)
    }

    async fn delete_file(&self, auth: &GuestCredentials, path: &str) -> Result<(), GuestOpsError> {
        let url = self.url(&["filesystem", "files", path], "delete")?;
        let body = CredentialsOnly {
            credentials: auth.into(),
        };
        self.post("delete file", url, &body, auth).await?;
        Ok(())
    }
}
