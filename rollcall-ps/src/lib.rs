//! rollcall-ps library - Proximity Scanner
//!
//! Student-device side of attendance verification: discovers nearby teacher
//! beacons within a bounded window, ranks them by signal strength, and
//! packages the strongest one together with a biometric sample for the
//! verification service.

pub mod error;
pub mod events;
pub mod radio;
pub mod scanner;
pub mod session;
pub mod submit;

pub use error::{ScanError, SubmitError};
pub use events::{ScanEvent, StopReason};
pub use scanner::{ProximityScanner, ScanStart};
pub use session::{classify, BeaconCandidate, Proximity, ScanSession};
