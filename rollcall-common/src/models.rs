//! Attendance record model shared by the ledger and the HTTP surface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Error;

/// Whether the subject attended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            other => Err(Error::InvalidInput(format!("Unknown attendance status: {}", other))),
        }
    }
}

/// How a record was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationMethod {
    /// Biometric match gated by a proximity claim (automatic path)
    #[serde(rename = "biometric+proximity")]
    BiometricProximity,
    /// Entered by a teacher
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "other")]
    Other,
}

impl VerificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationMethod::BiometricProximity => "biometric+proximity",
            VerificationMethod::Manual => "manual",
            VerificationMethod::Other => "other",
        }
    }
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "biometric+proximity" => Ok(VerificationMethod::BiometricProximity),
            "manual" => Ok(VerificationMethod::Manual),
            "other" => Ok(VerificationMethod::Other),
            other => Err(Error::InvalidInput(format!("Unknown verification method: {}", other))),
        }
    }
}

/// One immutable attendance entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: Uuid,
    /// Student the record is about
    pub subject_id: String,
    /// Teacher (verifier) the record is attributed to
    pub target_id: String,
    pub course_id: String,
    pub date: DateTime<Utc>,
    pub status: AttendanceStatus,
    pub verification_method: VerificationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl AttendanceRecord {
    /// New record with a fresh id, dated now
    pub fn new(
        subject_id: impl Into<String>,
        target_id: impl Into<String>,
        course_id: impl Into<String>,
        status: AttendanceStatus,
        verification_method: VerificationMethod,
        location: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id: subject_id.into(),
            target_id: target_id.into(),
            course_id: course_id.into(),
            date: Utc::now(),
            status,
            verification_method,
            location,
        }
    }

    /// Override the timestamp (back-dated manual entries, tests)
    pub fn dated(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    /// Records subject to the one-per-subject/course/day rule
    pub fn is_unique_per_day(&self) -> bool {
        self.status == AttendanceStatus::Present
            && self.verification_method == VerificationMethod::BiometricProximity
    }
}

/// Ledger query narrowing. `None` fields do not filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttendanceFilter {
    pub course_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub subject_id: Option<String>,
    pub target_id: Option<String>,
}
