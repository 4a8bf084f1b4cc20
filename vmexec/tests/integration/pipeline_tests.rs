//! End-to-end runs against the in-process guest.

use super::common::{fast_config, init_test_logging, request, script_and_output_paths};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use vmexec::mock::{Fault, GuestCall, MockGuest, ScriptBehavior};
use vmexec::run::{
    CleanupOutcome, Orchestrator, RunError, RunOutcome, RunStage, TransferStepError,
};
use vmexec::{GuestOpsError, TransferError};
use vmexec_common::{GuestCredentials, VmTarget};

fn occurrences(paths: &[String], path: &str) -> usize {
    paths.iter().filter(|p| p.as_str() == path).count()
}

#[tokio::test(start_paused = true)]
async fn test_echo_script_output_lands_locally() {
    init_test_logging();
    crate::test_log!("TEST START: test_echo_script_output_lands_locally");

    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new();
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let report = orchestrator.run(&request("echo hi\n")).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed { exit_code: 0 });
    assert_eq!(report.script_exit_code, Some(0));
    assert_eq!(report.exit_status(), 0);
    assert_eq!(report.output_path, dir.path().join("web-01.txt"));
    let content = std::fs::read(&report.output_path).unwrap();
    assert_eq!(content, b"hi\nEXIT:0\n");
    assert_eq!(report.output_bytes, content.len() as u64);

    assert!(report.cleanup.is_clean());
    assert_eq!(report.cleanup.entries.len(), 2);
    assert!(guest.file_paths().is_empty(), "guest left with {:?}", guest.file_paths());

    crate::test_log!("TEST PASS: test_echo_script_output_lands_locally");
}

#[tokio::test(start_paused = true)]
async fn test_uploaded_bytes_match_payload() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new();
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));
    let script = "#!/bin/bash\necho one\necho two\n";

    let report = orchestrator.run(&request(script)).await.unwrap();

    assert_eq!(report.uploaded_bytes, script.len() as u64);
    let (script_path, _) = script_and_output_paths(&guest);
    assert_eq!(transfer.uploads(), vec![(script_path, script.len())]);
    let sizes: Vec<u64> = guest
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            GuestCall::InitiateUpload { size, overwrite, .. } => {
                assert!(overwrite);
                Some(size)
            }
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![script.len() as u64]);
}

#[tokio::test(start_paused = true)]
async fn test_empty_script_still_runs() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new();
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let report = orchestrator.run(&request("")).await.unwrap();

    assert_eq!(report.uploaded_bytes, 0);
    assert_eq!(std::fs::read(&report.output_path).unwrap(), b"EXIT:0\n");
}

#[tokio::test(start_paused = true)]
async fn test_completion_on_first_poll_does_not_wait() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().with_reported_exit_code(7);
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let report = orchestrator.run(&request("echo x\nexit 7\n")).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed { exit_code: 7 });
    assert_eq!(report.script_exit_code, Some(7));
    assert_eq!(report.exit_status(), 7);
    assert_eq!(guest.poll_count(), 1);
    assert!(report.elapsed < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_marker_exit_code_wins_over_listing() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    // The wrapper shell itself exits 0 after appending the marker.
    let guest = MockGuest::new().with_reported_exit_code(0);
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let report = orchestrator.run(&request("echo oops\nexit 3\n")).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed { exit_code: 0 });
    assert_eq!(report.script_exit_code, Some(3));
    assert_eq!(report.exit_status(), 3);
    assert_eq!(std::fs::read(&report.output_path).unwrap(), b"oops\nEXIT:3\n");
}

#[tokio::test(start_paused = true)]
async fn test_slow_completion_polls_until_done() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().completes_after_polls(Some(4));
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let report = orchestrator.run(&request("echo slow\n")).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed { exit_code: 0 });
    assert_eq!(guest.poll_count(), 4);
    assert!(report.elapsed >= Duration::from_secs(3));
    assert!(report.elapsed < Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_never_completing_times_out_with_partial_output() {
    init_test_logging();
    crate::test_log!("TEST START: test_never_completing_times_out_with_partial_output");

    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().completes_after_polls(None);
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let report = orchestrator.run(&request("echo started\n")).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::TimedOut);
    assert_eq!(report.script_exit_code, None);
    assert_eq!(report.exit_status(), 124);
    assert!(report.elapsed >= Duration::from_secs(30));
    assert!(report.elapsed < Duration::from_secs(600));

    // Retrieval still happens and yields what the script wrote so far.
    assert_eq!(transfer.downloads().len(), 1);
    assert_eq!(std::fs::read(&report.output_path).unwrap(), b"started\n");

    let (script_path, output_path) = script_and_output_paths(&guest);
    let deleted = guest.deleted_paths();
    assert_eq!(occurrences(&deleted, &script_path), 1);
    assert_eq!(occurrences(&deleted, &output_path), 1);

    crate::test_log!("TEST PASS: test_never_completing_times_out_with_partial_output");
}

#[tokio::test(start_paused = true)]
async fn test_fixed_output_is_retrieved_verbatim() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().with_behavior(ScriptBehavior::Fixed {
        output: "line 1\nline 2\n".to_string(),
        exit_code: 2,
    });
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let report = orchestrator.run(&request("ignored\n")).await.unwrap();

    assert_eq!(
        std::fs::read(&report.output_path).unwrap(),
        b"line 1\nline 2\nEXIT:2\n"
    );
    assert_eq!(report.exit_status(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_marker_after_unterminated_output() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new()
        .with_behavior(ScriptBehavior::Fixed {
            output: "no newline".to_string(),
            exit_code: 3,
        })
        .with_reported_exit_code(0);
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let report = orchestrator.run(&request("ignored\n")).await.unwrap();

    assert_eq!(
        std::fs::read(&report.output_path).unwrap(),
        b"no newlineEXIT:3\n"
    );
    assert_eq!(report.script_exit_code, Some(3));
    assert_eq!(report.exit_status(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_wrong_credentials_touch_nothing() {
    init_test_logging();
    crate::test_log!("TEST START: test_wrong_credentials_touch_nothing");

    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().accepting_only(GuestCredentials::new("root", "right"));
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let failure = orchestrator.run(&request("echo hi\n")).await.unwrap_err();

    assert!(matches!(failure.error, RunError::Auth(GuestOpsError::Auth(_))));
    assert!(failure.error.is_precondition());
    assert!(!failure.process_left_running);
    assert!(failure.cleanup.is_empty());
    assert_eq!(guest.upload_requests(), 0);
    assert!(guest.deleted_paths().is_empty());
    assert!(transfer.uploads().is_empty());
    assert!(!dir.path().join("web-01.txt").exists());

    crate::test_log!("TEST PASS: test_wrong_credentials_touch_nothing");
}

#[tokio::test(start_paused = true)]
async fn test_staging_failure_cleans_script_path_only() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new();
    let transfer = guest.transfer().failing_uploads(503);
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let failure = orchestrator.run(&request("echo hi\n")).await.unwrap_err();

    assert!(matches!(
        failure.error,
        RunError::Staging {
            source: TransferStepError::Transfer(TransferError::Status { status: 503, .. }),
            ..
        }
    ));
    let (script_path, _) = script_and_output_paths(&guest);
    assert_eq!(guest.deleted_paths(), vec![script_path.clone()]);
    assert_eq!(failure.cleanup.entries.len(), 1);
    assert_eq!(
        guest.count(|call| matches!(call, GuestCall::StartProcess { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_initiate_upload_fault_is_staging_error() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().with_fault(Fault::InitiateUpload);
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let failure = orchestrator.run(&request("echo hi\n")).await.unwrap_err();

    assert!(matches!(
        failure.error,
        RunError::Staging {
            source: TransferStepError::Guest(_),
            ..
        }
    ));
    assert!(transfer.uploads().is_empty());
    assert_eq!(guest.deleted_paths().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_launch_failure_cleans_both_paths_once() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().with_fault(Fault::StartProcess);
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let failure = orchestrator.run(&request("echo hi\n")).await.unwrap_err();

    assert!(matches!(failure.error, RunError::Launch { .. }));
    assert!(!failure.process_left_running);
    let (script_path, output_path) = script_and_output_paths(&guest);
    let deleted = guest.deleted_paths();
    assert_eq!(deleted.len(), 2);
    assert_eq!(occurrences(&deleted, &script_path), 1);
    assert_eq!(occurrences(&deleted, &output_path), 1);
    assert_eq!(
        failure.cleanup.outcome_for(&script_path),
        Some(&CleanupOutcome::Deleted)
    );
    // Never created, so the delete fails but is only reported.
    assert!(matches!(
        failure.cleanup.outcome_for(&output_path),
        Some(CleanupOutcome::Failed(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_poll_failure_cleans_both_paths_once() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().with_fault(Fault::ListProcesses);
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let failure = orchestrator.run(&request("echo hi\n")).await.unwrap_err();

    assert!(matches!(failure.error, RunError::Poll { .. }));
    assert!(failure.process_left_running);
    let (script_path, output_path) = script_and_output_paths(&guest);
    let deleted = guest.deleted_paths();
    assert_eq!(occurrences(&deleted, &script_path), 1);
    assert_eq!(occurrences(&deleted, &output_path), 1);
    assert!(failure.cleanup.is_clean());
}

#[tokio::test(start_paused = true)]
async fn test_retrieval_failure_still_cleans_up() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new();
    let transfer = guest.transfer().failing_downloads(500);
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let failure = orchestrator.run(&request("echo hi\n")).await.unwrap_err();

    assert!(matches!(
        failure.error,
        RunError::Retrieval {
            source: TransferStepError::Transfer(TransferError::Status { status: 500, .. }),
            ..
        }
    ));
    assert!(!failure.process_left_running);
    assert_eq!(guest.deleted_paths().len(), 2);
    assert!(failure.cleanup.is_clean());
    assert!(guest.file_paths().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_failure_is_not_fatal() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().with_fault(Fault::DeleteFile);
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let report = orchestrator.run(&request("echo hi\n")).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed { exit_code: 0 });
    assert!(!report.cleanup.is_clean());
    assert_eq!(report.cleanup.leftovers().count(), 2);
    assert_eq!(guest.file_paths().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_cleanup_gives_up_after_grace() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().with_delete_delay(Duration::from_secs(120));
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    let report = orchestrator.run(&request("echo hi\n")).await.unwrap();
    let (script_path, output_path) = script_and_output_paths(&guest);

    assert_eq!(report.outcome, RunOutcome::Completed { exit_code: 0 });
    assert_eq!(
        std::fs::read_to_string(&report.output_path).unwrap(),
        "hi\nEXIT:0\n"
    );
    assert!(matches!(
        report.cleanup.outcome_for(&script_path),
        Some(CleanupOutcome::Failed(_))
    ));
    assert_eq!(
        report.cleanup.outcome_for(&output_path),
        Some(&CleanupOutcome::Skipped)
    );
    assert_eq!(guest.deleted_paths(), vec![script_path]);
}

#[tokio::test(start_paused = true)]
async fn test_budget_shorter_than_completion_timeout() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().completes_after_polls(None);
    let transfer = guest.transfer();
    let mut config = fast_config(dir.path());
    config.completion_timeout = Duration::from_secs(300);
    config.run_budget = Duration::from_secs(60);
    let orchestrator = Orchestrator::new(&guest, &transfer, config);

    let failure = orchestrator.run(&request("echo hi\n")).await.unwrap_err();

    assert!(matches!(
        failure.error,
        RunError::BudgetExceeded {
            stage: RunStage::Poll,
            ..
        }
    ));
    assert!(failure.process_left_running);
    assert!(transfer.downloads().is_empty());
    assert_eq!(guest.deleted_paths().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_poll() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new().completes_after_polls(None);
    let transfer = guest.transfer();
    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()))
        .with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let failure = orchestrator.run(&request("echo hi\n")).await.unwrap_err();

    assert!(matches!(
        failure.error,
        RunError::Cancelled {
            stage: RunStage::Poll
        }
    ));
    assert!(guest.poll_count() < 30);
    assert_eq!(guest.deleted_paths().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_does_nothing() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new();
    let transfer = guest.transfer();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()))
        .with_cancellation(cancel);

    let failure = orchestrator.run(&request("echo hi\n")).await.unwrap_err();

    assert!(matches!(
        failure.error,
        RunError::Cancelled {
            stage: RunStage::Validate
        }
    ));
    assert!(guest.calls().is_empty());
    assert!(failure.cleanup.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_rejected_before_guest_calls() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new();
    let transfer = guest.transfer();
    let mut config = fast_config(dir.path());
    config.poll_interval = Duration::ZERO;
    let orchestrator = Orchestrator::new(&guest, &transfer, config);

    let failure = orchestrator.run(&request("echo hi\n")).await.unwrap_err();

    assert!(matches!(failure.error, RunError::Config(_)));
    assert!(guest.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_runs_use_distinct_paths() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new();
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(dir.path()));

    orchestrator.run(&request("echo one\n")).await.unwrap();
    orchestrator.run(&request("echo two\n")).await.unwrap();

    let uploads = transfer.uploads();
    assert_eq!(uploads.len(), 2);
    assert_ne!(uploads[0].0, uploads[1].0);
    let starts: Vec<String> = guest
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            GuestCall::StartProcess { arguments, .. } => Some(arguments),
            _ => None,
        })
        .collect();
    assert_eq!(starts.len(), 2);
    assert_ne!(starts[0], starts[1]);
}

#[tokio::test(start_paused = true)]
async fn test_launch_without_sudo() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let guest = MockGuest::new();
    let transfer = guest.transfer();
    let mut config = fast_config(dir.path());
    config.use_sudo = false;
    let orchestrator = Orchestrator::new(&guest, &transfer, config);

    orchestrator.run(&request("echo hi\n")).await.unwrap();

    let (program, arguments) = guest
        .calls()
        .into_iter()
        .find_map(|call| match call {
            GuestCall::StartProcess { program, arguments } => Some((program, arguments)),
            _ => None,
        })
        .unwrap();
    assert_eq!(program, "/bin/bash");
    assert!(arguments.starts_with("-lc '/bin/bash "));
    assert!(!arguments.contains("sudo"));
}

#[tokio::test(start_paused = true)]
async fn test_output_name_is_sanitized() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let output_dir = dir.path().join("nested").join("out");
    let guest = MockGuest::new();
    let transfer = guest.transfer();
    let orchestrator = Orchestrator::new(&guest, &transfer, fast_config(&output_dir));
    let mut req = request("echo hi\n");
    req.target = VmTarget::new("prod/web 01");

    let report = orchestrator.run(&req).await.unwrap();

    assert_eq!(report.output_path, output_dir.join("prod_web_01.txt"));
    assert!(report.output_path.exists());
}
