//! Radio abstraction the scanner drives
//!
//! The platform layer pushes discoveries into a channel handed over by
//! [`RadioAdapter::start_discovery`]; there is no polling interval on this side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::error::ScanError;

pub mod replay;
pub mod scripted;

pub use replay::ReplayRadio;
pub use scripted::ScriptedRadio;

/// Platform capability a scan depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Scan,
    Connect,
    CoarseLocation,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Scan => "bluetooth scan",
            Capability::Connect => "bluetooth connect",
            Capability::CoarseLocation => "coarse location",
        };
        f.write_str(name)
    }
}

/// Every capability must be granted before a scan starts
pub const REQUIRED_CAPABILITIES: [Capability; 3] =
    [Capability::Scan, Capability::Connect, Capability::CoarseLocation];

/// One advertisement heard by the radio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub device_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rssi: Option<i16>,
}

impl Discovery {
    pub fn new(device_id: impl Into<String>, name: impl Into<String>, rssi: i16) -> Self {
        Self {
            device_id: device_id.into(),
            name: Some(name.into()),
            rssi: Some(rssi),
        }
    }
}

/// Short-range radio used for beacon discovery
///
/// Implementations must tolerate `stop_discovery` being called when nothing is
/// running, and may keep delivering into a closed sender after a stop.
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Ask the platform for one capability
    async fn request_permission(&self, capability: Capability) -> bool;

    /// Radio present and switched on
    async fn is_powered_on(&self) -> bool;

    /// Begin delivering discoveries into `sink`
    async fn start_discovery(&self, sink: mpsc::Sender<Discovery>) -> Result<(), ScanError>;

    /// Release the radio. Synchronous so it can run from `Drop`.
    fn stop_discovery(&self);

    /// Tear down the adapter entirely
    fn shutdown(&self) {
        self.stop_discovery();
    }
}
