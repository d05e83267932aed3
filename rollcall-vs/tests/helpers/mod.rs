//! Shared fixtures for rollcall-vs integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use rollcall_common::api::{issue_token, Claims, Role};
use rollcall_common::db::init_database;
use rollcall_common::models::{AttendanceRecord, AttendanceStatus, VerificationMethod};
use rollcall_common::time::now_millis;
use rollcall_vs::{BiometricWorker, WorkerFailure, WorkerMode, WorkerOutcome};

/// Fresh on-disk database in its own temp dir
///
/// Keep the `TempDir` alive for as long as the pool is used.
pub async fn test_pool() -> (TempDir, SqlitePool) {
    let dir = TempDir::new().expect("temp dir");
    let pool = init_database(&dir.path().join("rollcall.db"))
        .await
        .expect("database init");
    (dir, pool)
}

/// Signed token valid for an hour
pub fn token(secret: i64, user_id: &str, role: Role) -> String {
    let claims = Claims {
        user_id: user_id.to_string(),
        role,
        expires_at_ms: now_millis() + 3_600_000,
    };
    issue_token(&claims, secret).expect("token")
}

pub fn biometric(subject: &str, course: &str) -> AttendanceRecord {
    AttendanceRecord::new(
        subject,
        "t1",
        course,
        AttendanceStatus::Present,
        VerificationMethod::BiometricProximity,
        None,
    )
}

enum Behavior {
    /// Matches whoever it is asked about; enrolls anyone
    Recognize(f64),
    Fixed(Result<WorkerOutcome, WorkerFailure>),
}

/// In-process stand-in for the biometric worker
///
/// A gated worker blocks every call until [`FakeWorker::release`] hands out
/// a permit, which lets tests observe the in-flight state.
pub struct FakeWorker {
    behavior: Behavior,
    gate: Option<Semaphore>,
    calls: AtomicUsize,
}

impl FakeWorker {
    pub fn recognizing() -> Self {
        Self {
            behavior: Behavior::Recognize(0.93),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn returning(outcome: WorkerOutcome) -> Self {
        Self {
            behavior: Behavior::Fixed(Ok(outcome)),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(failure: WorkerFailure) -> Self {
        Self {
            behavior: Behavior::Fixed(Err(failure)),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Let `n` blocked calls finish
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Wait until `n` calls have entered the worker
    pub async fn wait_for_calls(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.calls() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("worker was not invoked in time");
    }
}

#[async_trait]
impl BiometricWorker for FakeWorker {
    async fn invoke(
        &self,
        _sample: &[u8],
        subject_id: &str,
        mode: WorkerMode,
    ) -> Result<WorkerOutcome, WorkerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }

        match &self.behavior {
            Behavior::Recognize(confidence) => Ok(match mode {
                WorkerMode::Verify => WorkerOutcome::Matched {
                    identity: subject_id.to_string(),
                    confidence: *confidence,
                },
                WorkerMode::Enroll => WorkerOutcome::Enrolled {
                    message: "Face data registered successfully".to_string(),
                },
            }),
            Behavior::Fixed(result) => result.clone(),
        }
    }
}

pub fn shared(worker: FakeWorker) -> Arc<FakeWorker> {
    Arc::new(worker)
}
