//! In-memory radio driven by a fixed script or by direct `emit` calls

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Capability, Discovery, RadioAdapter};
use crate::error::ScanError;

#[derive(Default)]
struct ScriptedState {
    sink: Option<mpsc::Sender<Discovery>>,
    task: Option<JoinHandle<()>>,
    discovering: bool,
    starts: usize,
    stops: usize,
}

/// Radio whose behaviour is fully decided up front
///
/// The sink from the latest `start_discovery` is kept after a stop so `emit`
/// can imitate a platform that still fires callbacks late.
#[derive(Default)]
pub struct ScriptedRadio {
    denied: HashSet<Capability>,
    powered_off: bool,
    fail_start: bool,
    script: Vec<(Duration, Discovery)>,
    state: Mutex<ScriptedState>,
}

impl ScriptedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discoveries delivered at the given offsets from `start_discovery`
    pub fn with_script(mut self, script: Vec<(Duration, Discovery)>) -> Self {
        self.script = script;
        self
    }

    pub fn deny(mut self, capability: Capability) -> Self {
        self.denied.insert(capability);
        self
    }

    pub fn powered_off(mut self) -> Self {
        self.powered_off = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver one discovery now. Returns false if nobody received it.
    pub fn emit(&self, discovery: Discovery) -> bool {
        let sink = self.state().sink.clone();
        match sink {
            Some(sink) => sink.try_send(discovery).is_ok(),
            None => false,
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.state().discovering
    }

    pub fn start_count(&self) -> usize {
        self.state().starts
    }

    pub fn stop_count(&self) -> usize {
        self.state().stops
    }
}

#[async_trait]
impl RadioAdapter for ScriptedRadio {
    async fn request_permission(&self, capability: Capability) -> bool {
        !self.denied.contains(&capability)
    }

    async fn is_powered_on(&self) -> bool {
        !self.powered_off
    }

    async fn start_discovery(&self, sink: mpsc::Sender<Discovery>) -> Result<(), ScanError> {
        if self.fail_start {
            return Err(ScanError::DiscoveryFailed("scripted failure".to_string()));
        }

        let task = if self.script.is_empty() {
            None
        } else {
            let script = self.script.clone();
            let tx = sink.clone();
            Some(tokio::spawn(async move {
                let started = Instant::now();
                for (offset, discovery) in script {
                    tokio::time::sleep_until(started + offset).await;
                    if tx.send(discovery).await.is_err() {
                        break;
                    }
                }
            }))
        };

        let mut state = self.state();
        state.sink = Some(sink);
        state.task = task;
        state.discovering = true;
        state.starts += 1;
        Ok(())
    }

    fn stop_discovery(&self) {
        let mut state = self.state();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        if state.discovering {
            state.discovering = false;
            state.stops += 1;
        }
    }
}
