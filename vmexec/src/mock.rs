//! In-process guest for tests.
//!
//! [`MockGuest`] implements [`GuestOperations`] over an in-memory guest
//! filesystem and records every call. [`MockTransfer`] shares that filesystem
//! and plays the part of the HTTPS transfer endpoint. Launched scripts are
//! "executed" by a tiny interpreter ([`ScriptBehavior::Echo`]) or replaced by
//! canned output.

use crate::guest::{GuestOperations, GuestOpsError, TransferHandle};
use crate::transfer::{Transfer, TransferError, normalize_transfer_url};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use vmexec_common::{GuestCredentials, PosixFileAttributes, ProcessId, ProcessInfo};

/// Endpoint the mock resolves transfer URLs against.
pub const MOCK_ENDPOINT: &str = "https://vcenter.mock/";

static NEXT_PID: AtomicI64 = AtomicI64::new(1000);

type MockFs = Arc<Mutex<HashMap<String, Vec<u8>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a launched script behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptBehavior {
    /// Interpret `echo ...` and `exit N` lines of the staged script.
    Echo,
    /// Ignore the script and produce fixed output and exit code.
    Fixed { output: String, exit_code: i32 },
}

/// Guest operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    InitiateUpload,
    InitiateDownload,
    StartProcess,
    ListProcesses,
    DeleteFile,
}

/// A recorded guest-operations call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestCall {
    ValidateCredentials {
        user: String,
    },
    InitiateUpload {
        path: String,
        size: u64,
        attrs: PosixFileAttributes,
        overwrite: bool,
    },
    InitiateDownload {
        path: String,
    },
    StartProcess {
        program: String,
        arguments: String,
    },
    ListProcesses {
        pids: Vec<ProcessId>,
    },
    DeleteFile {
        path: String,
    },
}

#[derive(Debug)]
struct MockProcess {
    output_path: String,
    polls: u32,
    finished: bool,
    output: Vec<u8>,
    exit_code: i32,
}

#[derive(Debug, Default)]
struct GuestState {
    calls: Vec<GuestCall>,
    processes: HashMap<ProcessId, MockProcess>,
}

/// In-memory [`GuestOperations`] implementation.
#[derive(Debug)]
pub struct MockGuest {
    endpoint: Url,
    fs: MockFs,
    state: Mutex<GuestState>,
    accepted: Option<GuestCredentials>,
    behavior: ScriptBehavior,
    completes_after_polls: Option<u32>,
    reported_exit_code: i32,
    faults: HashSet<Fault>,
    delete_delay: Option<Duration>,
}

impl Default for MockGuest {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGuest {
    /// A guest that accepts any credentials and whose processes finish on
    /// the first poll.
    pub fn new() -> Self {
        Self {
            endpoint: Url::parse(MOCK_ENDPOINT).expect("mock endpoint is a valid URL"),
            fs: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(GuestState::default()),
            accepted: None,
            behavior: ScriptBehavior::Echo,
            completes_after_polls: Some(1),
            reported_exit_code: 0,
            faults: HashSet::new(),
            delete_delay: None,
        }
    }

    /// Reject every credential pair except `credentials`.
    pub fn accepting_only(mut self, credentials: GuestCredentials) -> Self {
        self.accepted = Some(credentials);
        self
    }

    pub fn with_behavior(mut self, behavior: ScriptBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Finish on the `polls`-th listing. `None` never finishes; partial output
    /// (without the exit marker) is written at launch instead.
    pub fn completes_after_polls(mut self, polls: Option<u32>) -> Self {
        self.completes_after_polls = polls;
        self
    }

    /// Exit code reported by the process listing (the wrapper shell's status).
    pub fn with_reported_exit_code(mut self, exit_code: i32) -> Self {
        self.reported_exit_code = exit_code;
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.insert(fault);
        self
    }

    /// Stall every `delete_file` call for `delay` before answering.
    pub fn with_delete_delay(mut self, delay: Duration) -> Self {
        self.delete_delay = Some(delay);
        self
    }

    /// A transfer endpoint sharing this guest's filesystem.
    pub fn transfer(&self) -> MockTransfer {
        MockTransfer {
            fs: Arc::clone(&self.fs),
            state: Mutex::new(TransferState::default()),
        }
    }

    /// Put a file on the guest.
    pub fn put_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        lock(&self.fs).insert(path.to_string(), content.into());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.fs).get(path).cloned()
    }

    /// Paths currently present on the guest, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = lock(&self.fs).keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn calls(&self) -> Vec<GuestCall> {
        lock(&self.state).calls.clone()
    }

    pub fn upload_requests(&self) -> usize {
        self.count(|call| matches!(call, GuestCall::InitiateUpload { .. }))
    }

    pub fn poll_count(&self) -> usize {
        self.count(|call| matches!(call, GuestCall::ListProcesses { .. }))
    }

    pub fn deleted_paths(&self) -> Vec<String> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                GuestCall::DeleteFile { path } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&GuestCall) -> bool) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    fn record(&self, call: GuestCall) {
        lock(&self.state).calls.push(call);
    }

    fn check_auth(&self, auth: &GuestCredentials) -> Result<(), GuestOpsError> {
        match &self.accepted {
            Some(accepted) if accepted != auth => Err(GuestOpsError::Auth(format!(
                "invalid user name or password for '{}'",
                auth.username
            ))),
            _ => Ok(()),
        }
    }

    fn check_fault(&self, fault: Fault, operation: &'static str) -> Result<(), GuestOpsError> {
        if self.faults.contains(&fault) {
            Err(GuestOpsError::Api {
                operation,
                status: Some(500),
                message: "injected fault".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn transfer_handle(&self, op: &str, path: &str) -> TransferHandle {
        let mut url = self.endpoint.join("/guestFile").unwrap_or_else(|_| self.endpoint.clone());
        url.query_pairs_mut()
            .append_pair("op", op)
            .append_pair("path", path);
        let placeholder = url
            .as_str()
            .replacen(self.endpoint.host_str().unwrap_or_default(), "*", 1);
        TransferHandle::new(placeholder)
    }

    /// Run `script` according to the configured behavior.
    fn execute(&self, script: Option<&[u8]>, script_path: &str) -> (Vec<u8>, i32) {
        match (&self.behavior, script) {
            (ScriptBehavior::Fixed { output, exit_code }, _) => {
                (output.clone().into_bytes(), *exit_code)
            }
            (ScriptBehavior::Echo, Some(script)) => interpret(&String::from_utf8_lossy(script)),
            (ScriptBehavior::Echo, None) => (
                format!("/bin/bash: {script_path}: No such file or directory\n").into_bytes(),
                127,
            ),
        }
    }

    fn finish(&self, process: &mut MockProcess) {
        let mut output = process.output.clone();
        output.extend_from_slice(format!("EXIT:{}\n", process.exit_code).as_bytes());
        lock(&self.fs).insert(process.output_path.clone(), output);
        process.finished = true;
    }
}

#[async_trait]
impl GuestOperations for MockGuest {
    async fn validate_credentials(&self, auth: &GuestCredentials) -> Result<(), GuestOpsError> {
        self.record(GuestCall::ValidateCredentials {
            user: auth.username.clone(),
        });
        self.check_auth(auth)
    }

    async fn initiate_upload(
        &self,
        auth: &GuestCredentials,
        path: &str,
        attrs: &PosixFileAttributes,
        size: u64,
        overwrite: bool,
    ) -> Result<TransferHandle, GuestOpsError> {
        self.record(GuestCall::InitiateUpload {
            path: path.to_string(),
            size,
            attrs: *attrs,
            overwrite,
        });
        self.check_auth(auth)?;
        self.check_fault(Fault::InitiateUpload, "initiate upload")?;
        if !overwrite && lock(&self.fs).contains_key(path) {
            return Err(GuestOpsError::api("initiate upload", "file already exists"));
        }
        Ok(self.transfer_handle("put", path))
    }

    async fn initiate_download(
        &self,
        auth: &GuestCredentials,
        path: &str,
    ) -> Result<TransferHandle, GuestOpsError> {
        self.record(GuestCall::InitiateDownload {
            path: path.to_string(),
        });
        self.check_auth(auth)?;
        self.check_fault(Fault::InitiateDownload, "initiate download")?;
        if !lock(&self.fs).contains_key(path) {
            return Err(GuestOpsError::api("initiate download", format!("file {path} not found")));
        }
        Ok(self.transfer_handle("get", path))
    }

    fn resolve_transfer_url(&self, handle: &TransferHandle) -> Result<Url, GuestOpsError> {
        normalize_transfer_url(&self.endpoint, handle.as_str()).map_err(GuestOpsError::from)
    }

    async fn start_process(
        &self,
        auth: &GuestCredentials,
        program: &str,
        arguments: &str,
    ) -> Result<ProcessId, GuestOpsError> {
        self.record(GuestCall::StartProcess {
            program: program.to_string(),
            arguments: arguments.to_string(),
        });
        self.check_auth(auth)?;
        self.check_fault(Fault::StartProcess, "start process")?;

        let (script_path, output_path) = parse_redirect(arguments).ok_or_else(|| {
            GuestOpsError::api("start process", format!("unsupported arguments: {arguments}"))
        })?;
        let script = self.file(&script_path);
        let (output, exit_code) = self.execute(script.as_deref(), &script_path);

        // The shell truncates the output file as soon as it starts.
        lock(&self.fs).insert(output_path.clone(), Vec::new());

        let pid = ProcessId(NEXT_PID.fetch_add(1, Ordering::SeqCst));
        let mut process = MockProcess {
            output_path,
            polls: 0,
            finished: false,
            output,
            exit_code,
        };
        match self.completes_after_polls {
            Some(0) => self.finish(&mut process),
            None => {
                lock(&self.fs).insert(process.output_path.clone(), process.output.clone());
            }
            Some(_) => {}
        }
        lock(&self.state).processes.insert(pid, process);
        Ok(pid)
    }

    async fn list_process_status(
        &self,
        auth: &GuestCredentials,
        pids: &[ProcessId],
    ) -> Result<Vec<ProcessInfo>, GuestOpsError> {
        self.record(GuestCall::ListProcesses {
            pids: pids.to_vec(),
        });
        self.check_auth(auth)?;
        self.check_fault(Fault::ListProcesses, "list processes")?;

        let mut state = lock(&self.state);
        let mut listing = Vec::new();
        for pid in pids {
            let Some(process) = state.processes.get_mut(pid) else {
                continue;
            };
            process.polls += 1;
            if !process.finished
                && let Some(limit) = self.completes_after_polls
                && process.polls >= limit
            {
                self.finish(process);
            }
            listing.push(ProcessInfo {
                pid: *pid,
                end_time: process.finished.then(Utc::now),
                exit_code: process.finished.then_some(self.reported_exit_code),
            });
        }
        Ok(listing)
    }

    async fn delete_file(&self, auth: &GuestCredentials, path: &str) -> Result<(), GuestOpsError> {
        self.record(GuestCall::DeleteFile {
            path: path.to_string(),
        });
        if let Some(delay) = self.delete_delay {
            tokio::time::sleep(delay).await;
        }
        self.check_auth(auth)?;
        self.check_fault(Fault::DeleteFile, "delete file")?;
        match lock(&self.fs).remove(path) {
            Some(_) => Ok(()),
            None => Err(GuestOpsError::api("delete file", format!("file {path} not found"))),
        }
    }
}

/// Minimal interpreter for `echo` and `exit` lines.
fn interpret(script: &str) -> (Vec<u8>, i32) {
    let mut output = String::new();
    for line in script.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "echo" {
            output.push('\n');
        } else if let Some(text) = line.strip_prefix("echo ") {
            output.push_str(unquote(text.trim()));
            output.push('\n');
        } else if let Some(code) = line.strip_prefix("exit") {
            return (output.into_bytes(), code.trim().parse().unwrap_or(0));
        }
    }
    (output.into_bytes(), 0)
}

fn unquote(text: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = text
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    text
}

/// Pull `(script, output)` out of `-lc '... <script> > <output> 2>&1; ...'`.
fn parse_redirect(arguments: &str) -> Option<(String, String)> {
    let quoted = arguments.trim().strip_prefix("-lc")?.trim();
    let inner = quoted
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .map(|s| s.replace("'\\''", "'"))
        .unwrap_or_else(|| quoted.to_string());

    let tokens: Vec<&str> = inner.split_whitespace().collect();
    let redirect = tokens.iter().position(|token| *token == ">")?;
    let script = tokens.get(redirect.checked_sub(1)?)?;
    let output = tokens.get(redirect + 1)?;
    Some((script.to_string(), output.to_string()))
}

#[derive(Debug, Default)]
struct TransferState {
    uploads: Vec<(String, usize)>,
    downloads: Vec<String>,
    upload_status: Option<u16>,
    download_status: Option<u16>,
}

/// [`Transfer`] that reads and writes [`MockGuest`]'s filesystem.
#[derive(Debug)]
pub struct MockTransfer {
    fs: MockFs,
    state: Mutex<TransferState>,
}

impl MockTransfer {
    /// Answer every upload with `status`.
    pub fn failing_uploads(self, status: u16) -> Self {
        lock(&self.state).upload_status = Some(status);
        self
    }

    /// Answer every download with `status`.
    pub fn failing_downloads(self, status: u16) -> Self {
        lock(&self.state).download_status = Some(status);
        self
    }

    /// `(guest path, bytes)` for each upload received.
    pub fn uploads(&self) -> Vec<(String, usize)> {
        lock(&self.state).uploads.clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        lock(&self.state).downloads.clone()
    }
}

fn guest_path(url: &Url) -> Result<String, TransferError> {
    url.query_pairs()
        .find(|(key, _)| key == "path")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| TransferError::Rejected(format!("no guest path in {url}")))
}

#[async_trait]
impl Transfer for MockTransfer {
    async fn upload(&self, url: &Url, bytes: &[u8]) -> Result<u64, TransferError> {
        let path = guest_path(url)?;
        let mut state = lock(&self.state);
        state.uploads.push((path.clone(), bytes.len()));
        if let Some(status) = state.upload_status {
            return Err(TransferError::Status {
                operation: "upload",
                status,
                body: "mock upload failure".to_string(),
            });
        }
        lock(&self.fs).insert(path, bytes.to_vec());
        Ok(bytes.len() as u64)
    }

    async fn download(&self, url: &Url, dest: &Path) -> Result<u64, TransferError> {
        let path = guest_path(url)?;
        let content = {
            let mut state = lock(&self.state);
            state.downloads.push(path.clone());
            if let Some(status) = state.download_status {
                return Err(TransferError::Status {
                    operation: "download",
                    status,
                    body: "mock download failure".to_string(),
                });
            }
            lock(&self.fs).get(&path).cloned()
        };
        let content = content.ok_or_else(|| TransferError::Status {
            operation: "download",
            status: 404,
            body: format!("{path} not found"),
        })?;

        tokio::fs::write(dest, &content)
            .await
            .map_err(|source| TransferError::LocalWrite {
                path: dest.to_path_buf(),
                source,
            })?;
        Ok(content.len() as u64)
    }
}
