//! Attendance endpoints: verify, cancel, manual entry, history

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use rollcall_common::models::{
    AttendanceFilter, AttendanceRecord, AttendanceStatus, VerificationMethod,
};
use rollcall_common::api::Role;
use rollcall_common::time::parse_date_bound;

use crate::api::Caller;
use crate::coordinator::VerificationRequest;
use crate::error::{ApiError, ApiResult};
use crate::ledger::LedgerScope;
use crate::AppState;

/// POST /api/attendance/verify body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBody {
    #[serde(default)]
    pub face_data: String,
    #[serde(default)]
    pub teacher_id: String,
    #[serde(default)]
    pub course_id: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub attendance_id: Uuid,
    pub confidence: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// POST /api/attendance/manual body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualBody {
    pub student_id: String,
    pub course_id: String,
    pub status: AttendanceStatus,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualResponse {
    pub attendance_id: Uuid,
}

/// GET /api/attendance/history query
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub course_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Teachers may narrow to one student
    pub student_id: Option<String>,
}

/// Decode a base64 sample, tolerating a `data:...;base64,` prefix
pub(crate) fn decode_sample(face_data: &str) -> Result<Vec<u8>, ApiError> {
    let encoded = match face_data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => face_data,
    };
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::InvalidRequest(format!("faceData is not valid base64: {}", e)))
}

pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(rejection.body_text())
        } else {
            ApiError::InvalidRequest(rejection.body_text())
        }
    })
}

/// POST /api/attendance/verify
pub async fn verify(
    State(state): State<AppState>,
    caller: Caller,
    payload: Result<Json<VerifyBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<VerifyResponse>)> {
    let subject_id = caller.require_student()?;
    let body = json_body(payload)?;
    let sample = decode_sample(&body.face_data)?;

    let request = VerificationRequest::new(
        subject_id,
        body.teacher_id,
        body.course_id,
        sample,
        body.location.filter(|l| !l.is_empty()),
    );
    let receipt = state.coordinator.verify(subject_id, request).await?;

    Ok((
        StatusCode::CREATED,
        Json(VerifyResponse {
            attendance_id: receipt.attendance_id,
            confidence: receipt.confidence,
        }),
    ))
}

/// DELETE /api/attendance/verify
///
/// Cancels the caller's own in-flight verification.
pub async fn cancel_verification(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    let subject_id = caller.require_student()?;
    let cancelled = state.coordinator.cancel(subject_id);
    Ok((StatusCode::ACCEPTED, Json(CancelResponse { cancelled })))
}

/// POST /api/attendance/manual
///
/// Teacher entry; the teacher becomes the record's target.
pub async fn mark_manual(
    State(state): State<AppState>,
    caller: Caller,
    payload: Result<Json<ManualBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ManualResponse>)> {
    let teacher_id = caller.require_teacher()?;
    let body = json_body(payload)?;

    if body.student_id.trim().is_empty() || body.course_id.trim().is_empty() {
        return Err(ApiError::InvalidRequest(
            "studentId and courseId are required".to_string(),
        ));
    }

    let record = AttendanceRecord::new(
        body.student_id,
        teacher_id,
        body.course_id,
        body.status,
        VerificationMethod::Manual,
        body.location.filter(|l| !l.is_empty()),
    );
    info!(
        teacher_id = %teacher_id,
        subject_id = %record.subject_id,
        status = %record.status,
        "Manual attendance entry"
    );
    let attendance_id = state.ledger.append(record).await?;

    Ok((StatusCode::CREATED, Json(ManualResponse { attendance_id })))
}

/// GET /api/attendance/history
///
/// Students see their own records, teachers the records attributed to them.
pub async fn history(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<AttendanceRecord>>> {
    let from = parse_bound(query.start_date.as_deref(), "startDate", false)?;
    let to = parse_bound(query.end_date.as_deref(), "endDate", true)?;

    let scope = match caller.role {
        Role::Student => LedgerScope::Subject(caller.user_id.clone()),
        Role::Teacher => LedgerScope::Target(caller.user_id.clone()),
    };
    let filter = AttendanceFilter {
        course_id: query.course_id.filter(|c| !c.is_empty()),
        from,
        to,
        subject_id: query.student_id.filter(|s| !s.is_empty()),
        target_id: None,
    };

    let records = state.ledger.query(&scope, &filter).await?;
    Ok(Json(records))
}

fn parse_bound(
    value: Option<&str>,
    name: &str,
    end_of_day: bool,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, ApiError> {
    match value.filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => parse_date_bound(v, end_of_day)
            .map(Some)
            .ok_or_else(|| ApiError::InvalidRequest(format!("{} is not a date: {}", name, v))),
    }
}

pub fn attendance_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/attendance/verify",
            post(verify).delete(cancel_verification),
        )
        .route("/api/attendance/manual", post(mark_manual))
        .route("/api/attendance/history", get(history))
}
