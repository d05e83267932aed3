//! Caller authentication via signed bearer tokens
//!
//! # Token format
//!
//! `<base64url(canonical claims JSON)>.<signature>`
//!
//! - Claims carry the caller's user id, role and expiry (Unix epoch ms)
//! - Signature is SHA-256 (64 hex chars) of the canonical claims JSON with the
//!   shared secret appended as a decimal i64 string
//! - Shared secret stored in the database settings table
//!
//! Token issuance belongs to the login service; `issue_token` is exposed for
//! trusted tooling and tests. This module contains only pure functions and
//! database operations, no HTTP framework code.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

#[cfg(feature = "sqlx")]
use sqlx::SqlitePool;

// ========================================
// Error Types
// ========================================

/// Authentication error types
#[derive(Debug, Clone, PartialEq)]
pub enum ApiAuthError {
    /// Token is not `<claims>.<signature>` or the claims do not decode
    Malformed(String),

    /// Signature does not match the claims
    InvalidSignature,

    /// Token expiry is in the past
    Expired { expires_at_ms: i64, now_ms: i64 },

    /// Database error loading shared secret
    DatabaseError(String),
}

impl fmt::Display for ApiAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiAuthError::Malformed(reason) => write!(f, "Malformed token: {}", reason),
            ApiAuthError::InvalidSignature => write!(f, "Invalid token signature"),
            ApiAuthError::Expired { expires_at_ms, now_ms } => write!(
                f,
                "Token expired {}ms ago",
                now_ms.saturating_sub(*expires_at_ms)
            ),
            ApiAuthError::DatabaseError(err) => write!(f, "Database error: {}", err),
        }
    }
}

impl std::error::Error for ApiAuthError {}

// ========================================
// Claims
// ========================================

/// Caller role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
}

/// Identity carried by a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub role: Role,
    pub expires_at_ms: i64,
}

// ========================================
// Shared Secret Management
// ========================================

/// Load shared secret from database settings
///
/// Key `token_shared_secret`. Generated on first use.
#[cfg(feature = "sqlx")]
pub async fn load_shared_secret(db: &SqlitePool) -> Result<i64, ApiAuthError> {
    let result: Option<(String,)> =
        sqlx::query_as("SELECT value FROM settings WHERE key = 'token_shared_secret'")
            .fetch_optional(db)
            .await
            .map_err(|e| ApiAuthError::DatabaseError(e.to_string()))?;

    match result {
        Some((value,)) => value
            .parse::<i64>()
            .map_err(|e| ApiAuthError::DatabaseError(format!("Invalid i64: {}", e))),
        None => initialize_shared_secret(db).await,
    }
}

/// Generate and store a non-zero random secret
///
/// `INSERT OR IGNORE` followed by a re-read keeps two services starting at the
/// same time on one secret.
#[cfg(feature = "sqlx")]
pub async fn initialize_shared_secret(db: &SqlitePool) -> Result<i64, ApiAuthError> {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let secret: i64 = loop {
        let val = rng.gen::<i64>();
        if val != 0 {
            break val;
        }
    };

    sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES ('token_shared_secret', ?)")
        .bind(secret.to_string())
        .execute(db)
        .await
        .map_err(|e| ApiAuthError::DatabaseError(e.to_string()))?;

    let (stored,): (String,) =
        sqlx::query_as("SELECT value FROM settings WHERE key = 'token_shared_secret'")
            .fetch_one(db)
            .await
            .map_err(|e| ApiAuthError::DatabaseError(e.to_string()))?;

    stored
        .parse::<i64>()
        .map_err(|e| ApiAuthError::DatabaseError(format!("Invalid i64: {}", e)))
}

// ========================================
// Signing
// ========================================

/// Convert JSON to canonical form (sorted keys, no whitespace)
///
/// # Examples
///
/// ```
/// use rollcall_common::api::auth::to_canonical_json;
/// use serde_json::json;
///
/// let json = json!({"z": 3, "a": 1, "m": 2});
/// let canonical = to_canonical_json(&json);
///
/// assert!(canonical.starts_with("{\"a\":"));
/// ```
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let items: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| format!("\"{}\":{}", k, to_canonical_json(v)))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
    }
}

/// SHA-256 hex of canonical JSON + shared secret
pub fn calculate_signature(canonical: &str, shared_secret: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}{}", canonical, shared_secret).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonical_claims(claims: &Claims) -> Result<String, ApiAuthError> {
    let value = serde_json::to_value(claims).map_err(|e| ApiAuthError::Malformed(e.to_string()))?;
    Ok(to_canonical_json(&value))
}

/// Sign claims into a bearer token
///
/// # Examples
///
/// ```
/// use rollcall_common::api::auth::{issue_token, validate_token, Claims, Role};
///
/// let claims = Claims {
///     user_id: "s1".to_string(),
///     role: Role::Student,
///     expires_at_ms: 2_000_000_000_000,
/// };
/// let token = issue_token(&claims, 42).unwrap();
/// assert_eq!(validate_token(&token, 42, 1_700_000_000_000).unwrap(), claims);
/// assert!(validate_token(&token, 43, 1_700_000_000_000).is_err());
/// ```
pub fn issue_token(claims: &Claims, shared_secret: i64) -> Result<String, ApiAuthError> {
    let canonical = canonical_claims(claims)?;
    let signature = calculate_signature(&canonical, shared_secret);
    Ok(format!("{}.{}", URL_SAFE_NO_PAD.encode(canonical.as_bytes()), signature))
}

/// Verify a bearer token and return its claims
pub fn validate_token(token: &str, shared_secret: i64, now_ms: i64) -> Result<Claims, ApiAuthError> {
    let (encoded, provided) = token
        .trim()
        .split_once('.')
        .ok_or_else(|| ApiAuthError::Malformed("missing signature separator".to_string()))?;

    let raw = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| ApiAuthError::Malformed(format!("claims are not base64url: {}", e)))?;
    let claims: Claims = serde_json::from_slice(&raw)
        .map_err(|e| ApiAuthError::Malformed(format!("claims are not valid JSON: {}", e)))?;

    // Re-canonicalize so the signature covers exactly the decoded claims
    let canonical = canonical_claims(&claims)?;
    if canonical.as_bytes() != raw.as_slice() {
        return Err(ApiAuthError::Malformed("claims are not canonical".to_string()));
    }

    let calculated = calculate_signature(&canonical, shared_secret);
    if provided != calculated {
        return Err(ApiAuthError::InvalidSignature);
    }

    if claims.expires_at_ms <= now_ms {
        return Err(ApiAuthError::Expired {
            expires_at_ms: claims.expires_at_ms,
            now_ms,
        });
    }

    if claims.user_id.is_empty() {
        return Err(ApiAuthError::Malformed("empty user id".to_string()));
    }

    Ok(claims)
}
