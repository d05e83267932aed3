//! Attendance ledger
//!
//! Append-only store of [`AttendanceRecord`]s. There is no update or delete;
//! corrections are new records. The one-biometric-presence-per-day rule is
//! enforced by a partial unique index, so two concurrent appends for the same
//! subject, course and day cannot both succeed.

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rollcall_common::models::{
    AttendanceFilter, AttendanceRecord, AttendanceStatus, VerificationMethod,
};
use rollcall_common::time::calendar_day;
use rollcall_common::Error;

use crate::db::retry_on_lock;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    /// A biometric presence already exists for this subject, course and day
    #[error("Attendance already recorded for {subject_id} in {course_id} on {day}")]
    DuplicateAttendance {
        subject_id: String,
        course_id: String,
        day: String,
    },

    /// The store could not be reached or stayed locked
    #[error("Attendance storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The filter asks for records outside the caller's scope
    #[error("Forbidden: {0}")]
    Forbidden(String),
}

/// Whose records a query may see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerScope {
    /// Records about this subject
    Subject(String),
    /// Records attributed to this target (verifier)
    Target(String),
}

#[async_trait]
pub trait AttendanceLedger: Send + Sync {
    /// Store a new record and return its id
    async fn append(&self, record: AttendanceRecord) -> Result<Uuid, LedgerError>;

    /// Records visible to `scope` that match `filter`, newest first
    async fn query(
        &self,
        scope: &LedgerScope,
        filter: &AttendanceFilter,
    ) -> Result<Vec<AttendanceRecord>, LedgerError>;
}

/// SQLite-backed ledger
pub struct SqliteLedger {
    pool: SqlitePool,
    lock_wait_ms: u64,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool, lock_wait_ms: u64) -> Self {
        Self { pool, lock_wait_ms }
    }
}

#[async_trait]
impl AttendanceLedger for SqliteLedger {
    async fn append(&self, record: AttendanceRecord) -> Result<Uuid, LedgerError> {
        let pool = &self.pool;
        let record_ref = &record;
        let result = retry_on_lock("attendance append", self.lock_wait_ms, || {
            insert_record(pool, record_ref)
        })
        .await;

        match result {
            Ok(()) => {
                info!(
                    attendance_id = %record.id,
                    subject_id = %record.subject_id,
                    course_id = %record.course_id,
                    method = %record.verification_method,
                    "Attendance recorded"
                );
                Ok(record.id)
            }
            Err(e) if is_unique_violation(&e) => {
                let day = calendar_day(&record.date);
                warn!(
                    subject_id = %record.subject_id,
                    course_id = %record.course_id,
                    %day,
                    "Duplicate attendance rejected"
                );
                Err(LedgerError::DuplicateAttendance {
                    subject_id: record.subject_id,
                    course_id: record.course_id,
                    day,
                })
            }
            Err(e) => Err(LedgerError::StorageUnavailable(e.to_string())),
        }
    }

    async fn query(
        &self,
        scope: &LedgerScope,
        filter: &AttendanceFilter,
    ) -> Result<Vec<AttendanceRecord>, LedgerError> {
        check_scope(scope, filter)?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, subject_id, target_id, course_id, date_ms, status, \
             verification_method, location FROM attendance WHERE ",
        );
        match scope {
            LedgerScope::Subject(id) => qb.push("subject_id = ").push_bind(id.clone()),
            LedgerScope::Target(id) => qb.push("target_id = ").push_bind(id.clone()),
        };
        if let Some(course_id) = &filter.course_id {
            qb.push(" AND course_id = ").push_bind(course_id.clone());
        }
        if let Some(subject_id) = &filter.subject_id {
            qb.push(" AND subject_id = ").push_bind(subject_id.clone());
        }
        if let Some(target_id) = &filter.target_id {
            qb.push(" AND target_id = ").push_bind(target_id.clone());
        }
        if let Some(from) = &filter.from {
            qb.push(" AND date_ms >= ").push_bind(from.timestamp_millis());
        }
        if let Some(to) = &filter.to {
            qb.push(" AND date_ms <= ").push_bind(to.timestamp_millis());
        }
        qb.push(" ORDER BY date_ms DESC, rowid DESC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(?scope, count = records.len(), "Attendance query");
        Ok(records)
    }
}

/// A filter may narrow within the scope but never widen it
fn check_scope(scope: &LedgerScope, filter: &AttendanceFilter) -> Result<(), LedgerError> {
    match scope {
        LedgerScope::Subject(id) => {
            if let Some(requested) = filter.subject_id.as_ref().filter(|s| *s != id) {
                return Err(LedgerError::Forbidden(format!(
                    "cannot view records of subject {}",
                    requested
                )));
            }
        }
        LedgerScope::Target(id) => {
            if let Some(requested) = filter.target_id.as_ref().filter(|t| *t != id) {
                return Err(LedgerError::Forbidden(format!(
                    "cannot view records attributed to {}",
                    requested
                )));
            }
        }
    }
    Ok(())
}

async fn insert_record(pool: &SqlitePool, record: &AttendanceRecord) -> rollcall_common::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO attendance
            (id, subject_id, target_id, course_id, date_ms, day, status, verification_method, location)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.id.to_string())
    .bind(&record.subject_id)
    .bind(&record.target_id)
    .bind(&record.course_id)
    .bind(record.date.timestamp_millis())
    .bind(calendar_day(&record.date))
    .bind(record.status.as_str())
    .bind(record.verification_method.as_str())
    .bind(&record.location)
    .execute(pool)
    .await?;

    Ok(())
}

fn is_unique_violation(err: &Error) -> bool {
    match err {
        Error::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
        _ => false,
    }
}

fn record_from_row(row: &SqliteRow) -> Result<AttendanceRecord, LedgerError> {
    let corrupt = |what: &str, detail: String| {
        LedgerError::StorageUnavailable(format!("corrupt attendance row ({}): {}", what, detail))
    };
    let get_text = |column: &str| -> Result<String, LedgerError> {
        row.try_get::<String, _>(column)
            .map_err(|e| corrupt(column, e.to_string()))
    };

    let id = get_text("id")?;
    let id = Uuid::parse_str(&id).map_err(|e| corrupt("id", e.to_string()))?;
    let date_ms: i64 = row
        .try_get("date_ms")
        .map_err(|e| corrupt("date_ms", e.to_string()))?;
    let date = DateTime::from_timestamp_millis(date_ms)
        .ok_or_else(|| corrupt("date_ms", date_ms.to_string()))?;
    let status: AttendanceStatus = get_text("status")?
        .parse()
        .map_err(|e: Error| corrupt("status", e.to_string()))?;
    let verification_method: VerificationMethod = get_text("verification_method")?
        .parse()
        .map_err(|e: Error| corrupt("verification_method", e.to_string()))?;
    let location: Option<String> = row
        .try_get("location")
        .map_err(|e| corrupt("location", e.to_string()))?;

    Ok(AttendanceRecord {
        id,
        subject_id: get_text("subject_id")?,
        target_id: get_text("target_id")?,
        course_id: get_text("course_id")?,
        date,
        status,
        verification_method,
        location,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_scope_cannot_widen() {
        let scope = LedgerScope::Subject("s1".to_string());
        let own = AttendanceFilter {
            subject_id: Some("s1".to_string()),
            ..Default::default()
        };
        let other = AttendanceFilter {
            subject_id: Some("s2".to_string()),
            ..Default::default()
        };
        assert!(check_scope(&scope, &own).is_ok());
        assert!(matches!(
            check_scope(&scope, &other),
            Err(LedgerError::Forbidden(_))
        ));
    }

    #[test]
    fn test_target_scope_may_narrow_by_subject() {
        let scope = LedgerScope::Target("t1".to_string());
        let filter = AttendanceFilter {
            subject_id: Some("s9".to_string()),
            ..Default::default()
        };
        assert!(check_scope(&scope, &filter).is_ok());

        let other = AttendanceFilter {
            target_id: Some("t2".to_string()),
            ..Default::default()
        };
        assert!(check_scope(&scope, &other).is_err());
    }
}
