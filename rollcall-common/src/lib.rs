//! # Rollcall Common Library
//!
//! Shared code for the rollcall services including:
//! - Attendance record model and database bootstrap
//! - Configuration loading and root folder resolution
//! - Caller token authentication
//! - Calendar-day and timestamp helpers

pub mod api;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod models;
pub mod time;

pub use error::{Error, Result};
