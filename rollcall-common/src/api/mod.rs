//! Caller authentication shared by rollcall services

pub mod auth;

pub use auth::{
    calculate_signature, issue_token, to_canonical_json, validate_token, ApiAuthError, Claims,
    Role,
};
