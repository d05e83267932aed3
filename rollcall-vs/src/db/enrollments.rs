//! Enrollment bookkeeping
//!
//! The biometric template itself lives with the worker; this table only
//! records that (and when) a subject enrolled.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use rollcall_common::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub subject_id: String,
    pub enrolled_at: DateTime<Utc>,
    pub message: Option<String>,
}

/// Insert or refresh the enrollment row for a subject
pub async fn record_enrollment(
    pool: &SqlitePool,
    subject_id: &str,
    message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO enrollments (subject_id, enrolled_at, message)
        VALUES (?, ?, ?)
        ON CONFLICT(subject_id) DO UPDATE SET
            enrolled_at = excluded.enrolled_at,
            message = excluded.message
        "#,
    )
    .bind(subject_id)
    .bind(Utc::now().to_rfc3339())
    .bind(message)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_enrollment(pool: &SqlitePool, subject_id: &str) -> Result<Option<Enrollment>> {
    let row = sqlx::query("SELECT subject_id, enrolled_at, message FROM enrollments WHERE subject_id = ?")
        .bind(subject_id)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let enrolled_at: String = row.get("enrolled_at");
    let enrolled_at = DateTime::parse_from_rfc3339(&enrolled_at)
        .map_err(|e| Error::Internal(format!("Bad enrolled_at for {}: {}", subject_id, e)))?
        .with_timezone(&Utc);

    Ok(Some(Enrollment {
        subject_id: row.get("subject_id"),
        enrolled_at,
        message: row.get("message"),
    }))
}
