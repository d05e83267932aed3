//! Student enrollment endpoint

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::attendance::{decode_sample, json_body};
use crate::api::Caller;
use crate::db::{record_enrollment, retry_on_lock};
use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollBody {
    #[serde(default)]
    pub face_data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollResponse {
    pub subject_id: String,
    pub message: String,
}

/// POST /api/students/enroll
///
/// Runs the worker in enroll mode for the calling student. Shares the
/// per-subject in-flight slot with verification.
pub async fn enroll(
    State(state): State<AppState>,
    caller: Caller,
    payload: Result<Json<EnrollBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<EnrollResponse>)> {
    let subject_id = caller.require_student()?;
    let body = json_body(payload)?;
    let sample = decode_sample(&body.face_data)?;

    let receipt = state.coordinator.enroll(subject_id, &sample).await?;

    let message = Some(receipt.message.as_str()).filter(|m| !m.is_empty());
    retry_on_lock("enrollment record", state.lock_wait_ms, || {
        record_enrollment(&state.db, subject_id, message)
    })
    .await?;

    let message = if receipt.message.is_empty() {
        "Face data registered successfully".to_string()
    } else {
        receipt.message
    };

    Ok((
        StatusCode::CREATED,
        Json(EnrollResponse {
            subject_id: receipt.subject_id,
            message,
        }),
    ))
}

pub fn student_routes() -> Router<AppState> {
    Router::new().route("/api/students/enroll", post(enroll))
}
