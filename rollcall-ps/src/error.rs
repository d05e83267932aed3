//! Error types for rollcall-ps

use thiserror::Error;

use crate::radio::Capability;

/// Scanner failures
///
/// Starting a scan while one is running is not an error; see
/// [`crate::scanner::ScanStart::AlreadyScanning`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The platform refused a capability the scan needs
    #[error("Permission denied: {0}")]
    PermissionDenied(Capability),

    /// Radio missing or switched off
    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),

    /// The adapter failed to begin discovery
    #[error("Discovery failed to start: {0}")]
    DiscoveryFailed(String),
}

/// Errors submitting a verification to the server
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Definitive biometric mismatch; retrying needs new evidence
    #[error("Verification failed, does not match: {0}")]
    Rejected(String),

    /// Transient failure on the server side; safe to try again
    #[error("Please try again: {0}")]
    Retryable(String),

    /// Token missing, expired or not allowed to perform the request
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// Already recorded today, or another attempt is in flight
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request could not be built or was refused as invalid
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
