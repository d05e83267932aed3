//! Client for the verification service
//!
//! Packages `{sample, claimed teacher id, course id, location}` and maps the
//! service's structured errors back onto [`SubmitError`] so the UI can tell
//! "try again" apart from "does not match".

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::SubmitError;
use crate::session::BeaconCandidate;

/// POST /api/attendance/verify body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequestBody {
    pub face_data: String,
    pub teacher_id: String,
    pub course_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl VerifyRequestBody {
    /// The beacon's device id is the claimed teacher id
    pub fn new(
        sample: &[u8],
        beacon: &BeaconCandidate,
        course_id: impl Into<String>,
        location: Option<String>,
    ) -> Self {
        Self {
            face_data: STANDARD.encode(sample),
            teacher_id: beacon.device_id.clone(),
            course_id: course_id.into(),
            location,
        }
    }
}

/// Successful verification
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub attendance_id: String,
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(default)]
    retryable: bool,
}

pub struct VerificationClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl VerificationClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, SubmitError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub async fn verify(&self, body: &VerifyRequestBody) -> Result<VerifyResponse, SubmitError> {
        let url = format!("{}/api/attendance/verify", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let parsed: VerifyResponse = response.json().await?;
            info!(attendance_id = %parsed.attendance_id, "Attendance recorded");
            return Ok(parsed);
        }

        let text = response.text().await.unwrap_or_default();
        let err = classify_error(status.as_u16(), &text);
        warn!(status = status.as_u16(), error = %err, "Verification not accepted");
        Err(err)
    }
}

/// Map a non-2xx response to the client-side error class
pub fn classify_error(status: u16, body: &str) -> SubmitError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let (code, message, retryable) = match parsed {
        Some(env) => (env.error.code, env.error.message, env.error.retryable),
        None => (String::new(), body.to_string(), status >= 500),
    };

    match code.as_str() {
        "REJECTED" => SubmitError::Rejected(message),
        "UNAUTHORIZED" | "FORBIDDEN" => SubmitError::Unauthorized(message),
        "DUPLICATE_ATTENDANCE" | "VERIFICATION_IN_PROGRESS" | "CANCELLED" => {
            SubmitError::Conflict(message)
        }
        "INVALID_REQUEST" => SubmitError::Invalid(message),
        _ if retryable => SubmitError::Retryable(message),
        _ => match status {
            401 | 403 => SubmitError::Unauthorized(message),
            409 => SubmitError::Conflict(message),
            400..=499 => SubmitError::Invalid(message),
            _ => SubmitError::Retryable(message),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_uses_device_id_and_base64() {
        let beacon = BeaconCandidate {
            device_id: "AA:BB".to_string(),
            display_name: "Teacher-AA".to_string(),
            signal_strength: -60,
        };
        let body = VerifyRequestBody::new(b"img", &beacon, "c1", None);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["teacherId"], "AA:BB");
        assert_eq!(json["faceData"], "aW1n");
        assert_eq!(json["courseId"], "c1");
        assert!(json.get("location").is_none());
    }

    #[test]
    fn test_error_classes() {
        let rejected = r#"{"error":{"code":"REJECTED","message":"does not match","retryable":false}}"#;
        assert!(matches!(classify_error(422, rejected), SubmitError::Rejected(_)));

        let worker = r#"{"error":{"code":"WORKER_UNAVAILABLE","message":"try again","retryable":true}}"#;
        assert!(matches!(classify_error(503, worker), SubmitError::Retryable(_)));

        let dup = r#"{"error":{"code":"DUPLICATE_ATTENDANCE","message":"already","retryable":false}}"#;
        assert!(matches!(classify_error(409, dup), SubmitError::Conflict(_)));

        assert!(matches!(classify_error(502, "Bad Gateway"), SubmitError::Retryable(_)));
        assert!(matches!(classify_error(401, ""), SubmitError::Unauthorized(_)));
    }
}
