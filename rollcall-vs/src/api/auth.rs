//! Caller authentication
//!
//! Handlers take a [`Caller`] argument; extraction validates the
//! `Authorization: Bearer <token>` header against the shared secret and
//! rejects with 401 before the handler runs.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use tracing::debug;

use rollcall_common::api::auth::{validate_token, Role};
use rollcall_common::time::now_millis;

use crate::error::ApiError;
use crate::AppState;

/// Authenticated identity of the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

impl Caller {
    /// The caller's id if they are a student, 403 otherwise
    pub fn require_student(&self) -> Result<&str, ApiError> {
        match self.role {
            Role::Student => Ok(&self.user_id),
            Role::Teacher => Err(ApiError::Forbidden(
                "only students can perform this action".to_string(),
            )),
        }
    }

    /// The caller's id if they are a teacher, 403 otherwise
    pub fn require_teacher(&self) -> Result<&str, ApiError> {
        match self.role {
            Role::Teacher => Ok(&self.user_id),
            Role::Student => Err(ApiError::Forbidden(
                "only teachers can perform this action".to_string(),
            )),
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("expected a bearer token".to_string()))?;

        let claims = validate_token(token, state.shared_secret, now_millis()).map_err(|e| {
            debug!(error = %e, "Token rejected");
            ApiError::Unauthorized(e.to_string())
        })?;

        Ok(Caller {
            user_id: claims.user_id,
            role: claims.role,
        })
    }
}
