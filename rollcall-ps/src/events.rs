//! Scanner notifications
//!
//! Subscribers get a `tokio::sync::broadcast` receiver; dropping it
//! unsubscribes. A receiver that falls behind sees `RecvError::Lagged` and can
//! resynchronize from [`crate::ProximityScanner::session`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::BeaconCandidate;

/// Why a scan session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The bounded window ran out
    WindowElapsed,
    /// `stop_scan` was called
    Stopped,
    /// The scanner was closed or dropped
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    Started {
        started_at: DateTime<Utc>,
    },
    /// A recognized beacon was discovered or its reading refreshed
    CandidateUpdated {
        candidate: BeaconCandidate,
    },
    Stopped {
        reason: StopReason,
        discovered: usize,
    },
}
