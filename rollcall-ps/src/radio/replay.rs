//! Radio that replays discoveries recorded as JSON lines
//!
//! Each line is one discovery plus the delay after scan start at which it is
//! delivered:
//!
//! ```text
//! {"after_ms": 120, "device_id": "AA:BB:CC:01", "name": "Teacher-t1", "rssi": -62}
//! {"after_ms": 480, "device_id": "AA:BB:CC:02", "name": "Teacher-t2", "rssi": -81}
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Capability, Discovery, RadioAdapter};
use crate::error::ScanError;

#[derive(Debug, Deserialize)]
struct ReplayLine {
    #[serde(default)]
    after_ms: u64,
    #[serde(flatten)]
    discovery: Discovery,
}

/// Replays a capture file; grants every permission
pub struct ReplayRadio {
    entries: Vec<(Duration, Discovery)>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayRadio {
    /// Parse a capture. Blank lines and `#` comments are skipped; malformed
    /// lines are logged and skipped.
    pub fn from_jsonl(content: &str) -> Self {
        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<ReplayLine>(line) {
                Ok(parsed) => {
                    entries.push((Duration::from_millis(parsed.after_ms), parsed.discovery))
                }
                Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed replay line"),
            }
        }
        entries.sort_by_key(|(after, _)| *after);
        Self {
            entries,
            task: Mutex::new(None),
        }
    }

    pub async fn from_file(path: &Path) -> std::io::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(Self::from_jsonl(&content))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RadioAdapter for ReplayRadio {
    async fn request_permission(&self, _capability: Capability) -> bool {
        true
    }

    async fn is_powered_on(&self) -> bool {
        true
    }

    async fn start_discovery(&self, sink: mpsc::Sender<Discovery>) -> Result<(), ScanError> {
        let entries = self.entries.clone();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            for (after, discovery) in entries {
                tokio::time::sleep_until(started + after).await;
                debug!(device_id = %discovery.device_id, "Replaying discovery");
                if sink.send(discovery).await.is_err() {
                    break;
                }
            }
        });

        let previous = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    fn stop_discovery(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}
