//! Database helpers for rollcall-vs

pub mod enrollments;
pub mod retry;

pub use enrollments::{load_enrollment, record_enrollment, Enrollment};
pub use retry::retry_on_lock;
