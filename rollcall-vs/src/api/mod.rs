//! HTTP API for rollcall-vs

pub mod attendance;
pub mod auth;
pub mod health;
pub mod students;

pub use attendance::{attendance_routes, cancel_verification, history, mark_manual, verify};
pub use auth::Caller;
pub use health::{health_check, health_routes};
pub use students::{enroll, student_routes};
