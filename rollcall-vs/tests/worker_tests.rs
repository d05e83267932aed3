//! Process worker boundary, driven by small shell scripts

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use rollcall_vs::worker::WorkerConfig;
use rollcall_vs::{BiometricWorker, ProcessWorker, WorkerFailure, WorkerMode, WorkerOutcome};

/// Worker that runs `body` under `/bin/sh`; `$1` mode, `$2` sample, `$3` subject
fn script_worker(dir: &TempDir, body: &str) -> (ProcessWorker, PathBuf) {
    let script = dir.path().join("worker.sh");
    std::fs::write(&script, body).unwrap();
    let staging = dir.path().join("staging");
    let config = WorkerConfig::new(
        "/bin/sh",
        vec![script.display().to_string()],
        staging.clone(),
    )
    .with_timeout(Duration::from_secs(5));
    (ProcessWorker::new(config), staging)
}

fn staged_files(staging: &Path) -> usize {
    match std::fs::read_dir(staging) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn test_match_reports_identity_and_confidence() {
    let dir = TempDir::new().unwrap();
    let (worker, staging) = script_worker(
        &dir,
        r#"
[ "$1" = "verify" ] || exit 9
[ "$(cat "$2")" = "jpeg-bytes" ] || exit 8
echo "{\"success\": true, \"student_id\": \"$3\", \"confidence\": 0.87}"
"#,
    );

    let outcome = worker.invoke(b"jpeg-bytes", "s1", WorkerMode::Verify).await.unwrap();
    assert_eq!(
        outcome,
        WorkerOutcome::Matched {
            identity: "s1".to_string(),
            confidence: 0.87
        }
    );
    assert_eq!(staged_files(&staging), 0);
}

#[tokio::test]
async fn test_enroll_mode_is_passed_through() {
    let dir = TempDir::new().unwrap();
    let (worker, staging) = script_worker(
        &dir,
        r#"
[ "$1" = "enroll" ] || exit 9
echo '{"success": true, "message": "Face data registered successfully"}'
"#,
    );

    let outcome = worker.invoke(b"jpeg-bytes", "s1", WorkerMode::Enroll).await.unwrap();
    assert_eq!(
        outcome,
        WorkerOutcome::Enrolled {
            message: "Face data registered successfully".to_string()
        }
    );
    assert_eq!(staged_files(&staging), 0);
}

#[tokio::test]
async fn test_leading_noise_lines_are_skipped() {
    let dir = TempDir::new().unwrap();
    let (worker, _staging) = script_worker(
        &dir,
        r#"
echo
echo '{"success": true, "message": "No matching face found"}'
echo 'trailing chatter'
"#,
    );

    let outcome = worker.invoke(b"x", "s1", WorkerMode::Verify).await.unwrap();
    assert_eq!(
        outcome,
        WorkerOutcome::NotMatched {
            reason: "No matching face found".to_string()
        }
    );
}

#[tokio::test]
async fn test_reported_failure() {
    let dir = TempDir::new().unwrap();
    let (worker, staging) = script_worker(
        &dir,
        r#"echo '{"success": false, "message": "No face detected in image"}'"#,
    );

    let err = worker.invoke(b"x", "s1", WorkerMode::Verify).await.unwrap_err();
    assert_eq!(
        err,
        WorkerFailure::WorkerReported {
            message: "No face detected in image".to_string()
        }
    );
    assert_eq!(staged_files(&staging), 0);
}

#[tokio::test]
async fn test_nonzero_exit_is_process_failure() {
    let dir = TempDir::new().unwrap();
    let (worker, staging) = script_worker(
        &dir,
        r#"
echo '{"success": false, "message": "Image file not found"}'
exit 3
"#,
    );

    let err = worker.invoke(b"x", "s1", WorkerMode::Verify).await.unwrap_err();
    assert_eq!(
        err,
        WorkerFailure::ProcessFailed {
            exit_code: Some(3),
            detail: "Image file not found".to_string()
        }
    );
    assert_eq!(staged_files(&staging), 0);
}

#[tokio::test]
async fn test_nonzero_exit_falls_back_to_stderr() {
    let dir = TempDir::new().unwrap();
    let (worker, _staging) = script_worker(&dir, "echo 'model file missing' >&2\nexit 2\n");

    let err = worker.invoke(b"x", "s1", WorkerMode::Verify).await.unwrap_err();
    assert_eq!(
        err,
        WorkerFailure::ProcessFailed {
            exit_code: Some(2),
            detail: "model file missing".to_string()
        }
    );
}

#[tokio::test]
async fn test_garbage_output_is_parse_failure() {
    let dir = TempDir::new().unwrap();
    let (worker, staging) = script_worker(&dir, "echo 'Traceback (most recent call last):'\n");

    let err = worker.invoke(b"x", "s1", WorkerMode::Verify).await.unwrap_err();
    assert!(matches!(err, WorkerFailure::ResultParse { .. }));
    assert_eq!(staged_files(&staging), 0);
}

#[tokio::test]
async fn test_empty_output_is_parse_failure() {
    let dir = TempDir::new().unwrap();
    let (worker, _staging) = script_worker(&dir, "exit 0\n");

    let err = worker.invoke(b"x", "s1", WorkerMode::Verify).await.unwrap_err();
    assert_eq!(err, WorkerFailure::ResultParse { raw: String::new() });
}

#[tokio::test]
async fn test_oversized_result_line_is_parse_failure() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("worker.sh");
    std::fs::write(&script, "head -c 5000 /dev/zero | tr '\\0' 'x'\necho\n").unwrap();
    let mut config = WorkerConfig::new(
        "/bin/sh",
        vec![script.display().to_string()],
        dir.path().join("staging"),
    );
    config.max_output_bytes = 1024;
    let worker = ProcessWorker::new(config);

    let err = worker.invoke(b"x", "s1", WorkerMode::Verify).await.unwrap_err();
    assert!(matches!(err, WorkerFailure::ResultParse { .. }));
}

#[tokio::test]
async fn test_timeout_kills_worker_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("worker.sh");
    std::fs::write(&script, "exec sleep 30\n").unwrap();
    let staging = dir.path().join("staging");
    let config = WorkerConfig::new(
        "/bin/sh",
        vec![script.display().to_string()],
        staging.clone(),
    )
    .with_timeout(Duration::from_millis(300));
    let worker = ProcessWorker::new(config);

    let started = Instant::now();
    let err = worker.invoke(b"x", "s1", WorkerMode::Verify).await.unwrap_err();

    assert!(matches!(err, WorkerFailure::ProcessFailed { exit_code: None, .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(staged_files(&staging), 0);
}

#[tokio::test]
async fn test_missing_program_is_launch_failure() {
    let dir = TempDir::new().unwrap();
    let staging = dir.path().join("staging");
    let worker = ProcessWorker::new(WorkerConfig::new(
        "/nonexistent/rollcall-worker",
        Vec::new(),
        staging.clone(),
    ));

    let err = worker.invoke(b"x", "s1", WorkerMode::Verify).await.unwrap_err();
    assert!(matches!(err, WorkerFailure::ProcessLaunch(_)));
    assert_eq!(staged_files(&staging), 0);
}

#[tokio::test]
async fn test_unusable_staging_dir_is_artifact_failure() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();
    let worker = ProcessWorker::new(WorkerConfig::new(
        "/bin/sh",
        vec!["-c".to_string(), "exit 0".to_string()],
        blocker.join("staging"),
    ));

    let err = worker.invoke(b"x", "s1", WorkerMode::Verify).await.unwrap_err();
    assert!(matches!(err, WorkerFailure::ArtifactIo(_)));
}

#[tokio::test]
async fn test_concurrent_calls_use_distinct_artifacts() {
    let dir = TempDir::new().unwrap();
    let (worker, staging) = script_worker(
        &dir,
        "sleep 0.2\necho \"{\\\"success\\\": true, \\\"message\\\": \\\"$2\\\"}\"\n",
    );

    let calls = (0..4).map(|i| {
        let subject = format!("s{}", i);
        let worker = &worker;
        async move { worker.invoke(b"x", &subject, WorkerMode::Verify).await }
    });
    let results = futures::future::join_all(calls).await;

    let mut paths: Vec<String> = results
        .into_iter()
        .map(|r| match r.unwrap() {
            WorkerOutcome::NotMatched { reason } => reason,
            other => panic!("unexpected outcome {:?}", other),
        })
        .collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 4);
    assert_eq!(staged_files(&staging), 0);
}
