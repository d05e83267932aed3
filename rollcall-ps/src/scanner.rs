//! Proximity scanner
//!
//! Drives one time-boxed discovery window at a time over a [`RadioAdapter`].
//! Recognized beacons are folded into a [`ScanSession`]; the radio is released
//! when the window elapses, on `stop_scan`, when starting fails, on `close`,
//! and when the scanner is dropped.
//!
//! The scanner is an explicitly constructed value. Whoever needs proximity
//! owns one (or borrows it); there is no process-wide instance.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rollcall_common::config::ScannerSettings;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ScanError;
use crate::events::{ScanEvent, StopReason};
use crate::radio::{Discovery, RadioAdapter, REQUIRED_CAPABILITIES};
use crate::session::{classify, BeaconCandidate, Proximity, ScanSession};

/// Discoveries buffered between the radio and the session
const DISCOVERY_BUFFER: usize = 256;
/// Scan events buffered per subscriber
const EVENT_CAPACITY: usize = 64;

/// Outcome of [`ProximityScanner::start_scan`]
#[derive(Debug, Clone)]
pub enum ScanStart {
    /// A new window was opened
    Started(ScanSession),
    /// A window was already open; it is returned unchanged
    AlreadyScanning(ScanSession),
}

impl ScanStart {
    pub fn session(&self) -> &ScanSession {
        match self {
            ScanStart::Started(s) | ScanStart::AlreadyScanning(s) => s,
        }
    }
}

#[derive(Default)]
struct ScannerState {
    /// Current session, or the last finished one
    session: Option<ScanSession>,
    /// Bumped on every start so a stale pump cannot touch a newer session
    generation: u64,
    pump: Option<JoinHandle<()>>,
}

struct Shared {
    radio: Arc<dyn RadioAdapter>,
    settings: ScannerSettings,
    state: Mutex<ScannerState>,
    events: broadcast::Sender<ScanEvent>,
    scanning: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ScannerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn is_recognized(&self, discovery: &Discovery) -> bool {
        discovery
            .name
            .as_deref()
            .map(|name| name.starts_with(&self.settings.name_prefix))
            .unwrap_or(false)
    }

    fn apply(&self, generation: u64, discovery: Discovery) {
        if !self.is_recognized(&discovery) {
            return;
        }

        let rssi = discovery.rssi.unwrap_or(self.settings.missing_rssi);
        let name = discovery.name.as_deref().unwrap_or_default();

        let updated = {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            match state.session.as_mut() {
                Some(session) => session.upsert(&discovery.device_id, name, rssi),
                None => None,
            }
        };

        if let Some(candidate) = updated {
            debug!(
                device_id = %candidate.device_id,
                rssi = candidate.signal_strength,
                "Beacon updated"
            );
            self.emit(ScanEvent::CandidateUpdated { candidate });
        }
    }

    /// End the session if it is still the active one for `generation`
    fn finish(&self, generation: Option<u64>, reason: StopReason) -> bool {
        let (discovered, pump) = {
            let mut state = self.state();
            if let Some(generation) = generation {
                if state.generation != generation {
                    return false;
                }
            }
            let pump = state.pump.take();
            match state.session.as_mut() {
                Some(session) if session.is_active() => {
                    session.deactivate();
                    // Release inside the lock so no discovery lands after the flip
                    self.radio.stop_discovery();
                    (session.len(), pump)
                }
                _ => return false,
            }
        };

        // The pump ends itself on WindowElapsed; anything else aborts it
        if reason != StopReason::WindowElapsed {
            if let Some(pump) = pump {
                pump.abort();
            }
        }

        self.scanning.send_replace(false);
        info!(?reason, discovered, "Proximity scan stopped");
        self.emit(ScanEvent::Stopped { reason, discovered });
        true
    }
}

/// Owns the radio for the lifetime of the scanner
pub struct ProximityScanner {
    shared: Arc<Shared>,
    start_lock: tokio::sync::Mutex<()>,
}

impl ProximityScanner {
    /// Take ownership of a radio. Nothing is started until `start_scan`.
    pub fn open(radio: Arc<dyn RadioAdapter>, settings: ScannerSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (scanning, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                radio,
                settings,
                state: Mutex::new(ScannerState::default()),
                events,
                scanning,
            }),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ScannerSettings {
        &self.shared.settings
    }

    /// Window length from configuration
    pub fn default_window(&self) -> Duration {
        Duration::from_millis(self.shared.settings.window_ms)
    }

    /// Open a discovery window of `window` length
    ///
    /// Idempotent: if a window is already open its session is returned as
    /// [`ScanStart::AlreadyScanning`] and the running timer is left alone.
    pub async fn start_scan(&self, window: Duration) -> Result<ScanStart, ScanError> {
        let _guard = self.start_lock.lock().await;

        if let Some(session) = self.active_session() {
            debug!("Scan already running, returning existing session");
            return Ok(ScanStart::AlreadyScanning(session));
        }

        let radio = &self.shared.radio;
        for capability in REQUIRED_CAPABILITIES {
            if !radio.request_permission(capability).await {
                warn!(%capability, "Scan permission denied");
                return Err(ScanError::PermissionDenied(capability));
            }
        }

        if !radio.is_powered_on().await {
            return Err(ScanError::RadioUnavailable("radio is not powered on".to_string()));
        }

        let (tx, rx) = mpsc::channel(DISCOVERY_BUFFER);
        if let Err(e) = radio.start_discovery(tx).await {
            radio.stop_discovery();
            warn!(error = %e, "Discovery failed to start");
            return Err(e);
        }

        let deadline = Instant::now() + window;
        let session = {
            let mut state = self.shared.state();
            state.generation += 1;
            let generation = state.generation;
            let session = ScanSession::new(
                rollcall_common::time::now(),
                self.shared.settings.smoothing_window,
            );
            state.session = Some(session.clone());
            state.pump = Some(tokio::spawn(pump(
                Arc::clone(&self.shared),
                generation,
                rx,
                deadline,
            )));
            session
        };

        self.shared.scanning.send_replace(true);
        info!(
            window_ms = window.as_millis() as u64,
            threshold = self.shared.settings.proximity_threshold,
            "Proximity scan started"
        );
        self.shared.emit(ScanEvent::Started {
            started_at: session.started_at(),
        });

        Ok(ScanStart::Started(session))
    }

    /// Close the current window early. No-op when nothing is running.
    pub fn stop_scan(&self) {
        self.shared.finish(None, StopReason::Stopped);
    }

    pub fn is_scanning(&self) -> bool {
        *self.shared.scanning.borrow()
    }

    /// Snapshot of the current session, or the last finished one
    pub fn session(&self) -> Option<ScanSession> {
        self.shared.state().session.clone()
    }

    fn active_session(&self) -> Option<ScanSession> {
        self.session().filter(|s| s.is_active())
    }

    /// Resolves once no window is open
    pub async fn wait_until_idle(&self) -> Option<ScanSession> {
        let mut rx = self.shared.scanning.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail
        let _ = rx.wait_for(|scanning| !*scanning).await;
        self.session()
    }

    /// Start a window (or join the running one) and wait for it to close
    pub async fn run_scan(&self, window: Duration) -> Result<ScanSession, ScanError> {
        let started = self.start_scan(window).await?;
        Ok(self
            .wait_until_idle()
            .await
            .unwrap_or_else(|| started.session().clone()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.shared.events.subscribe()
    }

    /// Classify against the configured threshold. With smoothing enabled a
    /// candidate known to the session is judged on its averaged reading.
    pub fn classify(&self, candidate: &BeaconCandidate) -> Proximity {
        let threshold = self.shared.settings.proximity_threshold;
        if self.shared.settings.smoothing_window > 1 {
            if let Some(strength) = self
                .shared
                .state()
                .session
                .as_ref()
                .and_then(|s| s.effective_strength(&candidate.device_id))
            {
                return classify(strength, threshold);
            }
        }
        classify(candidate.signal_strength, threshold)
    }

    /// Strongest in-proximity beacon; `None` when none was found
    pub fn best_candidate(&self) -> Option<BeaconCandidate> {
        let threshold = self.shared.settings.proximity_threshold;
        self.shared
            .state()
            .session
            .as_ref()
            .and_then(|s| s.best_candidate(threshold))
    }

    /// In-proximity beacons, strongest first
    pub fn nearby(&self) -> Vec<BeaconCandidate> {
        let threshold = self.shared.settings.proximity_threshold;
        self.shared
            .state()
            .session
            .as_ref()
            .map(|s| s.ranked(threshold))
            .unwrap_or_default()
    }

    pub fn is_in_proximity(&self, device_id: &str) -> bool {
        let threshold = self.shared.settings.proximity_threshold;
        self.shared
            .state()
            .session
            .as_ref()
            .and_then(|s| s.classify(device_id, threshold))
            == Some(Proximity::InProximity)
    }

    /// Stop any window and tear the radio down
    pub fn close(self) {
        self.shared.finish(None, StopReason::Closed);
        self.shared.radio.shutdown();
    }
}

impl Drop for ProximityScanner {
    fn drop(&mut self) {
        self.shared.finish(None, StopReason::Closed);
        if let Some(pump) = self.shared.state().pump.take() {
            pump.abort();
        }
    }
}

async fn pump(
    shared: Arc<Shared>,
    generation: u64,
    mut rx: mpsc::Receiver<Discovery>,
    deadline: Instant,
) {
    let window = tokio::time::sleep_until(deadline);
    tokio::pin!(window);

    loop {
        tokio::select! {
            _ = &mut window => break,
            discovery = rx.recv() => match discovery {
                Some(discovery) => shared.apply(generation, discovery),
                // Radio went quiet; the window still runs to its deadline
                None => {
                    (&mut window).await;
                    break;
                }
            },
        }
    }

    shared.finish(Some(generation), StopReason::WindowElapsed);
}
