//! rollcall-vs library - Verification Service
//!
//! Server side of attendance verification: accepts a biometric sample plus a
//! claimed proximity target, runs the external matcher, and records the
//! outcome in the attendance ledger.

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

pub mod api;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod ledger;
pub mod worker;

pub use crate::coordinator::{VerificationCoordinator, VerificationError, VerificationRequest};
pub use crate::error::{ApiError, ApiResult};
pub use crate::ledger::{AttendanceLedger, LedgerError, LedgerScope, SqliteLedger};
pub use crate::worker::{BiometricWorker, ProcessWorker, WorkerFailure, WorkerMode, WorkerOutcome};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Secret that signs caller tokens
    pub shared_secret: i64,
    pub coordinator: Arc<VerificationCoordinator>,
    pub ledger: Arc<dyn AttendanceLedger>,
    /// Upper bound on request bodies
    pub max_body_bytes: usize,
    /// Budget for retrying locked writes outside the ledger
    pub lock_wait_ms: u64,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Wire the SQLite ledger and a coordinator around `worker`
    pub fn new(
        db: SqlitePool,
        shared_secret: i64,
        worker: Arc<dyn BiometricWorker>,
        settings: &rollcall_common::config::ServerSettings,
    ) -> Self {
        let ledger: Arc<dyn AttendanceLedger> =
            Arc::new(SqliteLedger::new(db.clone(), settings.ledger_lock_wait_ms));
        let coordinator = Arc::new(VerificationCoordinator::new(worker, Arc::clone(&ledger)));
        Self {
            db,
            shared_secret,
            coordinator,
            ledger,
            max_body_bytes: settings.max_sample_bytes,
            lock_wait_ms: settings.ledger_lock_wait_ms,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
///
/// `/health` is public; everything under `/api` requires a bearer token,
/// checked by the [`api::Caller`] extractor in each handler.
pub fn build_router(state: AppState) -> Router {
    use axum::extract::DefaultBodyLimit;
    use tower_http::limit::RequestBodyLimitLayer;
    use tower_http::trace::TraceLayer;

    let max_body_bytes = state.max_body_bytes;

    Router::new()
        .merge(api::attendance_routes())
        .merge(api::student_routes())
        .merge(api::health_routes())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
