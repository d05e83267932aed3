//! Database bootstrap shared by rollcall services

pub mod init;

pub use init::*;
