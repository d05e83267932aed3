//! Verification coordinator
//!
//! Per-request state machine:
//!
//! ```text
//! Received -> Staged -> WorkerInvoked -> Matched  -> Recorded
//!                                     -> Rejected
//!                                     -> Errored
//!                   (cancelled at any point)      -> Discarded
//! ```
//!
//! At most one attempt (verify or enroll) is in flight per subject. A second
//! one is refused with [`VerificationError::VerificationInProgress`] instead of
//! queueing, so two workers never touch the same template at once.
//!
//! The worker part of an attempt runs on its own task that owns the subject's
//! slot. Dropping the caller's future (client disconnect) cancels the attempt:
//! the worker still runs to completion, then its result is discarded and the
//! slot released.
//!
//! A match whose ledger write fails with `StorageUnavailable` is kept; the
//! subject's next verification for the same course, target and day retries
//! only the write and does not run the worker again.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use rollcall_common::models::{AttendanceRecord, AttendanceStatus, VerificationMethod};
use rollcall_common::time::calendar_day;

use crate::ledger::{AttendanceLedger, LedgerError};
use crate::worker::{BiometricWorker, WorkerFailure, WorkerMode, WorkerOutcome};

/// One verification attempt. Immutable once built.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub subject_id: String,
    pub claimed_target_id: String,
    pub course_id: String,
    pub sample: Vec<u8>,
    pub location: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl VerificationRequest {
    pub fn new(
        subject_id: impl Into<String>,
        claimed_target_id: impl Into<String>,
        course_id: impl Into<String>,
        sample: Vec<u8>,
        location: Option<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            claimed_target_id: claimed_target_id.into(),
            course_id: course_id.into(),
            sample,
            location,
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Received,
    Staged,
    WorkerInvoked,
    Matched,
    Rejected,
    Errored,
    Recorded,
    Discarded,
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerificationState::Received => "received",
            VerificationState::Staged => "staged",
            VerificationState::WorkerInvoked => "worker_invoked",
            VerificationState::Matched => "matched",
            VerificationState::Rejected => "rejected",
            VerificationState::Errored => "errored",
            VerificationState::Recorded => "recorded",
            VerificationState::Discarded => "discarded",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VerificationError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A student tried to act for someone else
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("A verification for {0} is already in progress")]
    VerificationInProgress(String),

    /// The worker boundary failed; nothing was decided about the sample
    #[error("Verification could not be attempted: {0}")]
    Worker(#[from] WorkerFailure),

    /// Definitive biometric mismatch
    #[error("Verification failed, does not match: {0}")]
    Rejected(String),

    #[error("Attendance already recorded for {subject_id} in {course_id} on {day}")]
    DuplicateAttendance {
        subject_id: String,
        course_id: String,
        day: String,
    },

    /// The match succeeded but the record could not be written
    #[error("Attendance storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Verification cancelled")]
    Cancelled,

    /// The attempt's task died (panic or runtime shutdown)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VerificationError {
    /// Whether resubmitting (with a fresh sample) may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VerificationError::Worker(_) | VerificationError::StorageUnavailable(_)
        )
    }
}

impl From<LedgerError> for VerificationError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::DuplicateAttendance {
                subject_id,
                course_id,
                day,
            } => VerificationError::DuplicateAttendance {
                subject_id,
                course_id,
                day,
            },
            LedgerError::StorageUnavailable(msg) => VerificationError::StorageUnavailable(msg),
            LedgerError::Forbidden(msg) => VerificationError::NotAuthorized(msg),
        }
    }
}

/// A recorded verification
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReceipt {
    pub attendance_id: Uuid,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentReceipt {
    pub subject_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    Verify,
    Enroll,
}

struct InFlight {
    kind: AttemptKind,
    state: VerificationState,
    cancel: CancellationToken,
}

type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

fn lock(map: &InFlightMap) -> MutexGuard<'_, HashMap<String, InFlight>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

/// Holds a subject's in-flight slot; releases it on drop
struct AttemptGuard {
    map: InFlightMap,
    subject_id: String,
    cancel: CancellationToken,
}

impl AttemptGuard {
    fn set_state(&self, state: VerificationState) {
        if let Some(entry) = lock(&self.map).get_mut(&self.subject_id) {
            entry.state = state;
        }
        debug!(subject_id = %self.subject_id, %state, "Verification state");
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels this attempt if dropped before being disarmed
    fn cancel_on_drop(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        lock(&self.map).remove(&self.subject_id);
    }
}

/// A match whose ledger write failed; retried without the worker
struct PendingWrite {
    record: AttendanceRecord,
    confidence: f64,
}

/// Orchestrates verify and enroll attempts
///
/// Clones share the same in-flight and pending-write state.
#[derive(Clone)]
pub struct VerificationCoordinator {
    worker: Arc<dyn BiometricWorker>,
    ledger: Arc<dyn AttendanceLedger>,
    in_flight: InFlightMap,
    pending: Arc<Mutex<HashMap<String, PendingWrite>>>,
}

impl VerificationCoordinator {
    pub fn new(worker: Arc<dyn BiometricWorker>, ledger: Arc<dyn AttendanceLedger>) -> Self {
        Self {
            worker,
            ledger,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn AttendanceLedger> {
        &self.ledger
    }

    /// Run one verification for `caller_id`
    ///
    /// `caller_id` is the authenticated identity; the request's subject must
    /// be the same person.
    pub async fn verify(
        &self,
        caller_id: &str,
        request: VerificationRequest,
    ) -> Result<VerificationReceipt, VerificationError> {
        validate(caller_id, &request)?;

        let attempt = self.begin(&request.subject_id, AttemptKind::Verify)?;
        info!(
            subject_id = %request.subject_id,
            target_id = %request.claimed_target_id,
            course_id = %request.course_id,
            sample_bytes = request.sample.len(),
            "Verification received"
        );

        let cancel_on_drop = attempt.cancel_on_drop();
        let this = self.clone();
        let task = tokio::spawn(async move { this.run_verify(attempt, request).await });
        let result = joined(task.await);
        cancel_on_drop.disarm();
        result
    }

    async fn run_verify(
        &self,
        attempt: AttemptGuard,
        request: VerificationRequest,
    ) -> Result<VerificationReceipt, VerificationError> {
        attempt.set_state(VerificationState::Staged);
        if attempt.is_cancelled() {
            attempt.set_state(VerificationState::Discarded);
            return Err(VerificationError::Cancelled);
        }

        if let Some(pending) = self.take_pending(&request) {
            info!(
                subject_id = %request.subject_id,
                "Already matched, retrying the ledger write only"
            );
            attempt.set_state(VerificationState::Matched);
            return self.record(&attempt, pending.record, pending.confidence).await;
        }

        attempt.set_state(VerificationState::WorkerInvoked);
        let result = self
            .worker
            .invoke(&request.sample, &request.subject_id, WorkerMode::Verify)
            .await;

        // Cancellation never interrupts the worker; its result is dropped here
        if attempt.is_cancelled() {
            info!(subject_id = %request.subject_id, "Verification cancelled, result discarded");
            attempt.set_state(VerificationState::Discarded);
            return Err(VerificationError::Cancelled);
        }

        let confidence = match evaluate(&request.subject_id, result) {
            Ok(confidence) => {
                attempt.set_state(VerificationState::Matched);
                confidence
            }
            Err(err) => {
                let state = if matches!(err, VerificationError::Rejected(_)) {
                    VerificationState::Rejected
                } else {
                    VerificationState::Errored
                };
                attempt.set_state(state);
                return Err(err);
            }
        };

        let record = AttendanceRecord::new(
            request.subject_id.clone(),
            request.claimed_target_id.clone(),
            request.course_id.clone(),
            AttendanceStatus::Present,
            VerificationMethod::BiometricProximity,
            request.location.clone(),
        )
        .dated(request.submitted_at);

        self.record(&attempt, record, confidence).await
    }

    /// Hand a matched record to the ledger
    async fn record(
        &self,
        attempt: &AttemptGuard,
        record: AttendanceRecord,
        confidence: f64,
    ) -> Result<VerificationReceipt, VerificationError> {
        let subject_id = record.subject_id.clone();
        match self.ledger.append(record.clone()).await {
            Ok(attendance_id) => {
                attempt.set_state(VerificationState::Recorded);
                info!(
                    subject_id = %subject_id,
                    %attendance_id,
                    confidence,
                    "Verification recorded"
                );
                Ok(VerificationReceipt {
                    attendance_id,
                    confidence,
                })
            }
            Err(err) => {
                attempt.set_state(VerificationState::Errored);
                warn!(subject_id = %subject_id, error = %err, "Matched but not recorded");
                if matches!(err, LedgerError::StorageUnavailable(_)) {
                    self.lock_pending()
                        .insert(subject_id, PendingWrite { record, confidence });
                }
                Err(err.into())
            }
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingWrite>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A stashed match usable for `request`: same course, same target, same day
    fn take_pending(&self, request: &VerificationRequest) -> Option<PendingWrite> {
        let pending = self.lock_pending().remove(&request.subject_id)?;
        let record = &pending.record;
        let usable = record.course_id == request.course_id
            && record.target_id == request.claimed_target_id
            && calendar_day(&record.date) == calendar_day(&request.submitted_at);
        usable.then_some(pending)
    }

    /// Whether a matched-but-unwritten record is waiting for `subject_id`
    pub fn has_pending_write(&self, subject_id: &str) -> bool {
        self.lock_pending().contains_key(subject_id)
    }

    /// Store `sample` as `caller_id`'s template
    pub async fn enroll(
        &self,
        caller_id: &str,
        sample: &[u8],
    ) -> Result<EnrollmentReceipt, VerificationError> {
        if caller_id.trim().is_empty() {
            return Err(VerificationError::InvalidRequest("subject id is required".to_string()));
        }
        if sample.is_empty() {
            return Err(VerificationError::InvalidRequest("sample is empty".to_string()));
        }

        let attempt = self.begin(caller_id, AttemptKind::Enroll)?;
        let cancel_on_drop = attempt.cancel_on_drop();
        let this = self.clone();
        let subject_id = caller_id.to_string();
        let sample = sample.to_vec();
        let task =
            tokio::spawn(async move { this.run_enroll(attempt, subject_id, sample).await });
        let result = joined(task.await);
        cancel_on_drop.disarm();
        result
    }

    async fn run_enroll(
        &self,
        attempt: AttemptGuard,
        subject_id: String,
        sample: Vec<u8>,
    ) -> Result<EnrollmentReceipt, VerificationError> {
        let caller_id = subject_id.as_str();
        attempt.set_state(VerificationState::WorkerInvoked);
        let result = self.worker.invoke(&sample, caller_id, WorkerMode::Enroll).await;

        if attempt.is_cancelled() {
            attempt.set_state(VerificationState::Discarded);
            return Err(VerificationError::Cancelled);
        }

        match result {
            Ok(WorkerOutcome::Enrolled { message }) => {
                attempt.set_state(VerificationState::Recorded);
                info!(subject_id = %caller_id, "Enrollment stored");
                Ok(EnrollmentReceipt {
                    subject_id: caller_id.to_string(),
                    message,
                })
            }
            Ok(other) => {
                attempt.set_state(VerificationState::Errored);
                Err(unexpected(WorkerMode::Enroll, &other))
            }
            Err(failure) => {
                attempt.set_state(VerificationState::Errored);
                log_failure(caller_id, &failure);
                Err(failure.into())
            }
        }
    }

    /// Cancel `subject_id`'s in-flight attempt. Returns false if there is none.
    ///
    /// A worker already running is allowed to finish; its result is discarded.
    pub fn cancel(&self, subject_id: &str) -> bool {
        match lock(&self.in_flight).get(subject_id) {
            Some(entry) => {
                info!(subject_id = %subject_id, state = %entry.state, kind = ?entry.kind, "Cancelling attempt");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Current state of `subject_id`'s in-flight attempt
    pub fn state_of(&self, subject_id: &str) -> Option<VerificationState> {
        lock(&self.in_flight).get(subject_id).map(|entry| entry.state)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    fn begin(&self, subject_id: &str, kind: AttemptKind) -> Result<AttemptGuard, VerificationError> {
        let mut map = lock(&self.in_flight);
        if let Some(existing) = map.get(subject_id) {
            warn!(
                subject_id = %subject_id,
                state = %existing.state,
                "Attempt refused, another is in flight"
            );
            return Err(VerificationError::VerificationInProgress(subject_id.to_string()));
        }

        let cancel = CancellationToken::new();
        map.insert(
            subject_id.to_string(),
            InFlight {
                kind,
                state: VerificationState::Received,
                cancel: cancel.clone(),
            },
        );

        Ok(AttemptGuard {
            map: Arc::clone(&self.in_flight),
            subject_id: subject_id.to_string(),
            cancel,
        })
    }
}

fn validate(caller_id: &str, request: &VerificationRequest) -> Result<(), VerificationError> {
    if request.sample.is_empty() {
        return Err(VerificationError::InvalidRequest("sample is empty".to_string()));
    }
    if request.claimed_target_id.trim().is_empty() {
        return Err(VerificationError::InvalidRequest("teacher id is required".to_string()));
    }
    if request.course_id.trim().is_empty() {
        return Err(VerificationError::InvalidRequest("course id is required".to_string()));
    }
    if request.subject_id != caller_id {
        warn!(
            caller_id = %caller_id,
            subject_id = %request.subject_id,
            "Verification for another subject refused"
        );
        return Err(VerificationError::NotAuthorized(
            "students may only verify themselves".to_string(),
        ));
    }
    Ok(())
}

/// Matched only when the worker's identity is exactly the requester
fn evaluate(
    subject_id: &str,
    result: Result<WorkerOutcome, WorkerFailure>,
) -> Result<f64, VerificationError> {
    match result {
        Ok(WorkerOutcome::Matched {
            identity,
            confidence,
        }) => {
            if identity == subject_id {
                Ok(confidence)
            } else {
                warn!(
                    subject_id = %subject_id,
                    matched_identity = %identity,
                    confidence,
                    "Worker matched a different identity"
                );
                Err(VerificationError::Rejected(
                    "sample matched a different identity".to_string(),
                ))
            }
        }
        Ok(WorkerOutcome::NotMatched { reason }) => {
            info!(subject_id = %subject_id, %reason, "Sample did not match");
            Err(VerificationError::Rejected(reason))
        }
        Ok(other) => Err(unexpected(WorkerMode::Verify, &other)),
        Err(failure) => {
            log_failure(subject_id, &failure);
            Err(failure.into())
        }
    }
}

/// Flatten an attempt task's join result
fn joined<T>(
    result: Result<Result<T, VerificationError>, JoinError>,
) -> Result<T, VerificationError> {
    result.unwrap_or_else(|e| {
        Err(VerificationError::Internal(format!(
            "verification task failed: {}",
            e
        )))
    })
}

fn unexpected(mode: WorkerMode, outcome: &WorkerOutcome) -> VerificationError {
    let detail = match outcome {
        WorkerOutcome::WorkerError { detail } => detail.clone(),
        other => format!("unexpected {} outcome in {} mode", other.kind(), mode),
    };
    VerificationError::Worker(WorkerFailure::WorkerReported { message: detail })
}

fn log_failure(subject_id: &str, failure: &WorkerFailure) {
    let outcome = WorkerOutcome::from(failure);
    warn!(subject_id = %subject_id, outcome = outcome.kind(), error = %failure, "Worker call failed");
}
