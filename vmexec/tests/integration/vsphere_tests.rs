//! The REST-backed guest, session and transfer stack against a fake vCenter.

use super::common::init_test_logging;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use reqwest::Url;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use vmexec::guest::GuestOperations;
use vmexec::run::{Orchestrator, RunConfig, RunError, RunOutcome};
use vmexec::vsphere::{Session, VsphereError, VsphereGuest, endpoint_url};
use vmexec::{GuestOpsError, HttpTransfer};
use vmexec_common::{GuestCredentials, ProcessId, RunRequest, VmTarget};

const TOKEN: &str = "token-1";
/// `admin:secret`
const ADMIN_BASIC: &str = "Basic YWRtaW46c2VjcmV0";
const GUEST_USER: &str = "root";
const GUEST_PASSWORD: &str = "guestpw";
const GUEST_OUTPUT: &str = "hello from guest\n";

#[derive(Default)]
struct FakeVcenter {
    files: HashMap<String, Vec<u8>>,
    uploads: Vec<(String, Vec<u8>)>,
    processes: HashMap<i64, i32>,
    next_pid: i64,
    logouts: usize,
}

type Shared = Arc<Mutex<FakeVcenter>>;
type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn api_error(status: StatusCode, error_type: &str, message: &str) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({
            "error_type": error_type,
            "messages": [{"id": "fake", "default_message": message}],
        })),
    )
}

fn check_session(headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    match headers.get("vmware-api-session-id") {
        Some(token) if token == TOKEN => Ok(()),
        _ => Err(api_error(
            StatusCode::UNAUTHORIZED,
            "UNAUTHENTICATED",
            "session expired",
        )),
    }
}

fn check_guest(vm: &str, body: &Value) -> Result<(), (StatusCode, Json<Value>)> {
    if vm != "vm-42" {
        return Err(api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "no such VM"));
    }
    let creds = &body["credentials"];
    let user = creds["user_name"].as_str().unwrap_or_default();
    let password = creds["password"].as_str().unwrap_or_default();
    if user == GUEST_USER && password == GUEST_PASSWORD {
        Ok(())
    } else {
        // Echoes the password back so masking can be checked.
        Err(api_error(
            StatusCode::BAD_REQUEST,
            "UNAUTHENTICATED",
            &format!("guest login failed for {user} with password {password}"),
        ))
    }
}

fn transfer_handle(path: &str) -> String {
    let mut url = Url::parse("http://placeholder/transfer").unwrap();
    url.query_pairs_mut().append_pair("path", path);
    url.as_str().replacen("placeholder", "*", 1)
}

async fn login(headers: HeaderMap) -> ApiResult {
    match headers.get("authorization") {
        Some(value) if value == ADMIN_BASIC => Ok(Json(json!(TOKEN))),
        _ => Err(api_error(
            StatusCode::UNAUTHORIZED,
            "UNAUTHENTICATED",
            "Authentication required.",
        )),
    }
}

async fn logout(State(state): State<Shared>, headers: HeaderMap) -> StatusCode {
    if check_session(&headers).is_err() {
        return StatusCode::UNAUTHORIZED;
    }
    state.lock().unwrap().logouts += 1;
    StatusCode::NO_CONTENT
}

async fn datacenters(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> ApiResult {
    check_session(&headers)?;
    let listing = match q.get("names").map(String::as_str) {
        Some("DC1") => json!([{"datacenter": "datacenter-1", "name": "DC1"}]),
        _ => json!([]),
    };
    Ok(Json(listing))
}

async fn vms(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> ApiResult {
    check_session(&headers)?;
    let in_dc = q
        .get("datacenters")
        .is_none_or(|dc| dc == "datacenter-1");
    let listing = match q.get("names").map(String::as_str) {
        Some("web-01") if in_dc => {
            json!([{"vm": "vm-42", "name": "web-01", "power_state": "POWERED_ON"}])
        }
        _ => json!([]),
    };
    Ok(Json(listing))
}

async fn processes(
    State(state): State<Shared>,
    UrlPath(vm): UrlPath<String>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult {
    check_session(&headers)?;
    check_guest(&vm, &body)?;
    match q.get("action").map(String::as_str) {
        Some("list") => Ok(Json(json!([]))),
        Some("create") => {
            let arguments = body["spec"]["arguments"].as_str().unwrap_or_default();
            let tokens: Vec<&str> = arguments.split_whitespace().collect();
            let redirect = tokens.iter().position(|t| *t == ">").ok_or_else(|| {
                api_error(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", "no redirect")
            })?;
            let script = tokens[redirect - 1];
            let output = tokens[redirect + 1];

            let mut fake = state.lock().unwrap();
            let exit_code = if fake.files.contains_key(script) { 0 } else { 127 };
            fake.files.insert(
                output.to_string(),
                format!("{GUEST_OUTPUT}EXIT:{exit_code}\n").into_bytes(),
            );
            fake.next_pid += 1;
            let pid = 4000 + fake.next_pid;
            fake.processes.insert(pid, exit_code);
            Ok(Json(json!(pid)))
        }
        _ => Err(api_error(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", "bad action")),
    }
}

async fn process_get(
    State(state): State<Shared>,
    UrlPath((vm, pid)): UrlPath<(String, i64)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult {
    check_session(&headers)?;
    check_guest(&vm, &body)?;
    let fake = state.lock().unwrap();
    match fake.processes.get(&pid) {
        Some(exit_code) => Ok(Json(json!({
            "pid": pid,
            "name": "bash",
            "started": "2026-01-01T00:00:00Z",
            "finished": "2026-01-01T00:00:01.250Z",
            "exit_code": exit_code,
        }))),
        None => Err(api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "no such process")),
    }
}

async fn filesystem(
    State(state): State<Shared>,
    UrlPath(vm): UrlPath<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult {
    check_session(&headers)?;
    check_guest(&vm, &body)?;
    let path = body["spec"]["path"].as_str().unwrap_or_default();
    let is_upload = body["spec"].get("attributes").is_some();
    if !is_upload && !state.lock().unwrap().files.contains_key(path) {
        return Err(api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "file not found"));
    }
    Ok(Json(json!(transfer_handle(path))))
}

async fn delete_file(
    State(state): State<Shared>,
    UrlPath((vm, path)): UrlPath<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    check_session(&headers)?;
    check_guest(&vm, &body)?;
    match state.lock().unwrap().files.remove(&path) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "file not found")),
    }
}

async fn transfer_put(
    State(state): State<Shared>,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    let Some(path) = q.get("path") else {
        return StatusCode::BAD_REQUEST;
    };
    let mut fake = state.lock().unwrap();
    fake.files.insert(path.clone(), body.to_vec());
    fake.uploads.push((path.clone(), body.to_vec()));
    StatusCode::OK
}

async fn transfer_get(
    State(state): State<Shared>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Vec<u8>, StatusCode> {
    let path = q.get("path").ok_or(StatusCode::BAD_REQUEST)?;
    state
        .lock()
        .unwrap()
        .files
        .get(path)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

async fn spawn_vcenter() -> (Url, Shared) {
    let state = Shared::default();
    let app = Router::new()
        .route("/api/session", post(login).delete(logout))
        .route("/api/vcenter/datacenter", get(datacenters))
        .route("/api/vcenter/vm", get(vms))
        .route("/api/vcenter/vm/{vm}/guest/processes", post(processes))
        .route("/api/vcenter/vm/{vm}/guest/processes/{pid}", post(process_get))
        .route("/api/vcenter/vm/{vm}/guest/filesystem", post(filesystem))
        .route(
            "/api/vcenter/vm/{vm}/guest/filesystem/files/{path}",
            post(delete_file),
        )
        .route("/transfer", get(transfer_get).put(transfer_put))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (endpoint_url(&format!("http://{addr}")).unwrap(), state)
}

fn run_config(output_dir: &std::path::Path) -> RunConfig {
    RunConfig {
        output_dir: output_dir.to_path_buf(),
        poll_interval: Duration::from_millis(50),
        completion_timeout: Duration::from_secs(10),
        run_budget: Duration::from_secs(60),
        cleanup_grace: Duration::from_secs(10),
        ..RunConfig::default()
    }
}

#[tokio::test]
async fn test_full_run_through_rest_api() {
    init_test_logging();
    crate::test_log!("TEST START: test_full_run_through_rest_api");

    let (endpoint, state) = spawn_vcenter().await;
    let session = Session::login(&endpoint, "admin", "secret", false)
        .await
        .unwrap();
    let vm = session.find_vm("web-01", Some("DC1")).await.unwrap();
    assert_eq!(vm.id, "vm-42");

    let guest = VsphereGuest::new(&session, vm);
    let transfer = HttpTransfer::with_client(session.client().clone());
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(&guest, &transfer, run_config(dir.path()));
    let script = "#!/bin/bash\necho hello from guest\n";
    let request = RunRequest::new(
        VmTarget::new("web-01"),
        GuestCredentials::new(GUEST_USER, GUEST_PASSWORD),
        script,
    );

    let report = orchestrator.run(&request).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed { exit_code: 0 });
    assert_eq!(report.script_exit_code, Some(0));
    assert_eq!(
        std::fs::read_to_string(&report.output_path).unwrap(),
        format!("{GUEST_OUTPUT}EXIT:0\n")
    );
    assert!(report.cleanup.is_clean());
    {
        let fake = state.lock().unwrap();
        assert_eq!(fake.uploads.len(), 1);
        assert!(fake.uploads[0].0.starts_with("/tmp/vmexec_script_"));
        assert_eq!(fake.uploads[0].1, script.as_bytes());
        assert!(fake.files.is_empty(), "left on guest: {:?}", fake.files.keys());
    }

    session.logout().await.unwrap();
    assert_eq!(state.lock().unwrap().logouts, 1);

    crate::test_log!("TEST PASS: test_full_run_through_rest_api");
}

#[tokio::test]
async fn test_login_rejected() {
    init_test_logging();
    let (endpoint, _state) = spawn_vcenter().await;

    let err = Session::login(&endpoint, "admin", "wrong", false)
        .await
        .unwrap_err();

    match err {
        VsphereError::Login { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "Authentication required.");
        }
        other => panic!("expected login error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_vm_and_datacenter_lookup_failures() {
    init_test_logging();
    let (endpoint, _state) = spawn_vcenter().await;
    let session = Session::login(&endpoint, "admin", "secret", false)
        .await
        .unwrap();

    assert!(matches!(
        session.find_vm("db-01", None).await,
        Err(VsphereError::VmNotFound(name)) if name == "db-01"
    ));
    assert!(matches!(
        session.find_vm("web-01", Some("DC9")).await,
        Err(VsphereError::DatacenterNotFound(name)) if name == "DC9"
    ));
    assert_eq!(session.find_vm("web-01", None).await.unwrap().id, "vm-42");
}

#[tokio::test]
async fn test_guest_auth_failure_masks_password() {
    init_test_logging();
    let (endpoint, state) = spawn_vcenter().await;
    let session = Session::login(&endpoint, "admin", "secret", false)
        .await
        .unwrap();
    let vm = session.find_vm("web-01", None).await.unwrap();
    let guest = VsphereGuest::new(&session, vm);
    let transfer = HttpTransfer::with_client(session.client().clone());
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(&guest, &transfer, run_config(dir.path()));
    let request = RunRequest::new(
        VmTarget::new("web-01"),
        GuestCredentials::new(GUEST_USER, "hunter2"),
        "echo hi\n",
    );

    let failure = orchestrator.run(&request).await.unwrap_err();

    match &failure.error {
        RunError::Auth(GuestOpsError::Auth(message)) => {
            assert!(message.contains("guest login failed"));
            assert!(!message.contains("hunter2"));
        }
        other => panic!("expected auth error, got {other:?}"),
    }
    assert!(failure.cleanup.is_empty());
    assert!(state.lock().unwrap().uploads.is_empty());
}

#[tokio::test]
async fn test_unknown_pid_is_omitted_from_listing() {
    init_test_logging();
    let (endpoint, _state) = spawn_vcenter().await;
    let session = Session::login(&endpoint, "admin", "secret", false)
        .await
        .unwrap();
    let vm = session.find_vm("web-01", None).await.unwrap();
    let guest = VsphereGuest::new(&session, vm);
    let auth = GuestCredentials::new(GUEST_USER, GUEST_PASSWORD);

    let listing = guest
        .list_process_status(&auth, &[ProcessId(99)])
        .await
        .unwrap();

    assert!(listing.is_empty());
}

#[tokio::test]
async fn test_missing_guest_file_download_fails() {
    init_test_logging();
    let (endpoint, _state) = spawn_vcenter().await;
    let session = Session::login(&endpoint, "admin", "secret", false)
        .await
        .unwrap();
    let vm = session.find_vm("web-01", None).await.unwrap();
    let guest = VsphereGuest::new(&session, vm);
    let auth = GuestCredentials::new(GUEST_USER, GUEST_PASSWORD);

    let err = guest
        .initiate_download(&auth, "/tmp/does-not-exist")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GuestOpsError::Api {
            status: Some(404),
            ..
        }
    ));
}
