//! Verification coordinator with an in-process worker and a SQLite ledger

mod helpers;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use rollcall_common::models::{
    AttendanceFilter, AttendanceRecord, AttendanceStatus, VerificationMethod,
};
use rollcall_vs::coordinator::VerificationState;
use rollcall_vs::{
    AttendanceLedger, BiometricWorker, LedgerError, LedgerScope, SqliteLedger,
    VerificationCoordinator, VerificationError, VerificationRequest, WorkerFailure,
    WorkerOutcome,
};

use helpers::{test_pool, FakeWorker};

fn request(subject: &str) -> VerificationRequest {
    VerificationRequest::new(subject, "t1", "c1", b"jpeg-bytes".to_vec(), None)
}

fn coordinator(
    worker: &Arc<FakeWorker>,
    ledger: Arc<dyn AttendanceLedger>,
) -> Arc<VerificationCoordinator> {
    let worker: Arc<dyn BiometricWorker> = worker.clone();
    Arc::new(VerificationCoordinator::new(worker, ledger))
}

async fn records_of(ledger: &Arc<dyn AttendanceLedger>, subject: &str) -> Vec<AttendanceRecord> {
    ledger
        .query(
            &LedgerScope::Subject(subject.to_string()),
            &AttendanceFilter::default(),
        )
        .await
        .unwrap()
}

/// Fails the first `failures` appends, then delegates
struct FlakyLedger {
    inner: Arc<dyn AttendanceLedger>,
    failures: AtomicUsize,
    appends: AtomicUsize,
}

impl FlakyLedger {
    fn new(inner: Arc<dyn AttendanceLedger>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            appends: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AttendanceLedger for FlakyLedger {
    async fn append(&self, record: AttendanceRecord) -> Result<Uuid, LedgerError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerError::StorageUnavailable("database is locked".to_string()));
        }
        self.inner.append(record).await
    }

    async fn query(
        &self,
        scope: &LedgerScope,
        filter: &AttendanceFilter,
    ) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.inner.query(scope, filter).await
    }
}

#[tokio::test]
async fn test_match_is_recorded() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::recognizing());
    let coordinator = coordinator(&worker, Arc::clone(&ledger));

    let receipt = coordinator.verify("s1", request("s1")).await.unwrap();
    assert_eq!(receipt.confidence, 0.93);

    let records = records_of(&ledger, "s1").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, receipt.attendance_id);
    assert_eq!(records[0].target_id, "t1");
    assert_eq!(records[0].status, AttendanceStatus::Present);
    assert_eq!(records[0].verification_method, VerificationMethod::BiometricProximity);
    assert_eq!(coordinator.in_flight_count(), 0);
}

#[tokio::test]
async fn test_match_for_someone_else_is_rejected() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::returning(WorkerOutcome::Matched {
        identity: "s2".to_string(),
        confidence: 0.99,
    }));
    let coordinator = coordinator(&worker, Arc::clone(&ledger));

    let err = coordinator.verify("s1", request("s1")).await.unwrap_err();
    assert!(matches!(err, VerificationError::Rejected(_)));
    assert!(!err.is_retryable());
    assert!(records_of(&ledger, "s1").await.is_empty());
    assert!(records_of(&ledger, "s2").await.is_empty());
}

#[tokio::test]
async fn test_no_match_is_rejected() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::returning(WorkerOutcome::NotMatched {
        reason: "No face detected".to_string(),
    }));
    let coordinator = coordinator(&worker, Arc::clone(&ledger));

    let err = coordinator.verify("s1", request("s1")).await.unwrap_err();
    assert!(matches!(err, VerificationError::Rejected(_)));
    assert!(records_of(&ledger, "s1").await.is_empty());
}

#[tokio::test]
async fn test_worker_failure_is_retryable_and_records_nothing() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::failing(WorkerFailure::ProcessFailed {
        exit_code: Some(1),
        detail: "Image file not found".to_string(),
    }));
    let coordinator = coordinator(&worker, Arc::clone(&ledger));

    let err = coordinator.verify("s1", request("s1")).await.unwrap_err();
    assert!(matches!(err, VerificationError::Worker(_)));
    assert!(err.is_retryable());
    assert!(records_of(&ledger, "s1").await.is_empty());
}

#[tokio::test]
async fn test_invalid_requests_never_reach_the_worker() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::recognizing());
    let coordinator = coordinator(&worker, ledger);

    let empty = VerificationRequest::new("s1", "t1", "c1", Vec::new(), None);
    assert!(matches!(
        coordinator.verify("s1", empty).await,
        Err(VerificationError::InvalidRequest(_))
    ));

    let no_target = VerificationRequest::new("s1", "", "c1", b"x".to_vec(), None);
    assert!(matches!(
        coordinator.verify("s1", no_target).await,
        Err(VerificationError::InvalidRequest(_))
    ));

    assert!(matches!(
        coordinator.verify("s2", request("s1")).await,
        Err(VerificationError::NotAuthorized(_))
    ));

    assert_eq!(worker.calls(), 0);
}

#[tokio::test]
async fn test_second_attempt_for_same_subject_is_refused() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::recognizing().gated());
    let coordinator = coordinator(&worker, Arc::clone(&ledger));

    let first = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.verify("s1", request("s1")).await })
    };
    worker.wait_for_calls(1).await;
    assert_eq!(coordinator.state_of("s1"), Some(VerificationState::WorkerInvoked));

    let second = coordinator.verify("s1", request("s1")).await;
    assert!(matches!(second, Err(VerificationError::VerificationInProgress(_))));

    let enroll = coordinator.enroll("s1", b"jpeg-bytes").await;
    assert!(matches!(enroll, Err(VerificationError::VerificationInProgress(_))));
    assert_eq!(worker.calls(), 1);

    worker.release(1);
    assert!(first.await.unwrap().is_ok());
    assert_eq!(coordinator.in_flight_count(), 0);
    assert_eq!(records_of(&ledger, "s1").await.len(), 1);
}

#[tokio::test]
async fn test_different_subjects_run_concurrently() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::recognizing().gated());
    let coordinator = coordinator(&worker, Arc::clone(&ledger));

    let handles: Vec<_> = ["s1", "s2"]
        .into_iter()
        .map(|subject| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.verify(subject, request(subject)).await })
        })
        .collect();

    worker.wait_for_calls(2).await;
    assert_eq!(coordinator.in_flight_count(), 2);

    worker.release(2);
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(records_of(&ledger, "s1").await.len(), 1);
    assert_eq!(records_of(&ledger, "s2").await.len(), 1);
}

#[tokio::test]
async fn test_cancel_discards_worker_result() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::recognizing().gated());
    let coordinator = coordinator(&worker, Arc::clone(&ledger));

    assert!(!coordinator.cancel("s1"));

    let attempt = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.verify("s1", request("s1")).await })
    };
    worker.wait_for_calls(1).await;

    assert!(coordinator.cancel("s1"));
    worker.release(1);

    assert_eq!(attempt.await.unwrap(), Err(VerificationError::Cancelled));
    assert!(records_of(&ledger, "s1").await.is_empty());
    assert_eq!(coordinator.in_flight_count(), 0);
    assert!(!coordinator.cancel("s1"));
}

#[tokio::test]
async fn test_same_day_reverification_is_duplicate() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::recognizing());
    let coordinator = coordinator(&worker, Arc::clone(&ledger));

    coordinator.verify("s1", request("s1")).await.unwrap();
    let err = coordinator.verify("s1", request("s1")).await.unwrap_err();

    assert!(matches!(err, VerificationError::DuplicateAttendance { .. }));
    assert!(!err.is_retryable());
    assert_eq!(records_of(&ledger, "s1").await.len(), 1);
}

#[tokio::test]
async fn test_storage_failure_retries_write_without_worker() {
    let (_dir, pool) = test_pool().await;
    let sqlite: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let flaky = Arc::new(FlakyLedger::new(Arc::clone(&sqlite), 1));
    let worker = Arc::new(FakeWorker::recognizing());
    let coordinator = coordinator(&worker, flaky.clone());

    let err = coordinator.verify("s1", request("s1")).await.unwrap_err();
    assert!(matches!(err, VerificationError::StorageUnavailable(_)));
    assert!(err.is_retryable());
    assert!(coordinator.has_pending_write("s1"));
    assert_eq!(worker.calls(), 1);

    let receipt = coordinator.verify("s1", request("s1")).await.unwrap();
    assert_eq!(worker.calls(), 1);
    assert_eq!(flaky.appends.load(Ordering::SeqCst), 2);
    assert!(!coordinator.has_pending_write("s1"));

    let records = records_of(&sqlite, "s1").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, receipt.attendance_id);
}

#[tokio::test]
async fn test_pending_write_is_not_reused_for_another_course() {
    let (_dir, pool) = test_pool().await;
    let sqlite: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let flaky = Arc::new(FlakyLedger::new(Arc::clone(&sqlite), 1));
    let worker = Arc::new(FakeWorker::recognizing());
    let coordinator = coordinator(&worker, flaky);

    assert!(coordinator.verify("s1", request("s1")).await.is_err());

    let other_course = VerificationRequest::new("s1", "t1", "c2", b"jpeg-bytes".to_vec(), None);
    coordinator.verify("s1", other_course).await.unwrap();
    assert_eq!(worker.calls(), 2);

    let records = records_of(&sqlite, "s1").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].course_id, "c2");
}

#[tokio::test]
async fn test_enroll_returns_worker_message() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::recognizing());
    let coordinator = coordinator(&worker, Arc::clone(&ledger));

    let receipt = coordinator.enroll("s1", b"jpeg-bytes").await.unwrap();
    assert_eq!(receipt.subject_id, "s1");
    assert_eq!(receipt.message, "Face data registered successfully");
    assert!(records_of(&ledger, "s1").await.is_empty());

    assert!(matches!(
        coordinator.enroll("s1", b"").await,
        Err(VerificationError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_enroll_worker_failure_is_retryable() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::failing(WorkerFailure::WorkerReported {
        message: "No face detected in image".to_string(),
    }));
    let coordinator = coordinator(&worker, ledger);

    let err = coordinator.enroll("s1", b"jpeg-bytes").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(coordinator.in_flight_count(), 0);
}

async fn wait_until_idle(coordinator: &VerificationCoordinator) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while coordinator.in_flight_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("attempt did not finish");
}

#[tokio::test]
async fn test_dropped_verify_waits_for_worker_then_discards() {
    let (_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));
    let worker = Arc::new(FakeWorker::recognizing().gated());
    let coordinator = coordinator(&worker, Arc::clone(&ledger));

    // Caller goes away while the worker is running
    tokio::select! {
        _ = coordinator.verify("s1", request("s1")) => panic!("verify finished while gated"),
        _ = worker.wait_for_calls(1) => {}
    }

    assert_eq!(coordinator.in_flight_count(), 1);
    assert_eq!(coordinator.state_of("s1"), Some(VerificationState::WorkerInvoked));
    assert!(matches!(
        coordinator.verify("s1", request("s1")).await,
        Err(VerificationError::VerificationInProgress(_))
    ));

    worker.release(1);
    wait_until_idle(&coordinator).await;

    assert_eq!(worker.calls(), 1);
    assert!(records_of(&ledger, "s1").await.is_empty());
    coordinator.verify("s1", request("s1")).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_dropped_enroll_lets_worker_process_finish() {
    use rollcall_vs::worker::WorkerConfig;
    use rollcall_vs::ProcessWorker;
    use tempfile::TempDir;

    let (_db_dir, pool) = test_pool().await;
    let ledger: Arc<dyn AttendanceLedger> = Arc::new(SqliteLedger::new(pool, 500));

    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("template-written");
    let script = dir.path().join("worker.sh");
    std::fs::write(
        &script,
        format!(
            "sleep 0.5\ntouch '{}'\necho '{{\"success\": true, \"message\": \"stored\"}}'\n",
            marker.display()
        ),
    )
    .unwrap();
    let staging = dir.path().join("staging");
    let worker: Arc<dyn BiometricWorker> = Arc::new(ProcessWorker::new(
        WorkerConfig::new("/bin/sh", vec![script.display().to_string()], staging.clone())
            .with_timeout(Duration::from_secs(10)),
    ));
    let coordinator = VerificationCoordinator::new(worker, ledger);

    let dropped =
        tokio::time::timeout(Duration::from_millis(100), coordinator.enroll("s1", b"jpeg")).await;
    assert!(dropped.is_err());
    assert_eq!(coordinator.in_flight_count(), 1);
    assert!(!marker.exists());

    wait_until_idle(&coordinator).await;

    assert!(marker.exists());
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
}
