//! Scan session state: discovered beacons, classification and ranking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// A beacon heard during the current session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconCandidate {
    pub device_id: String,
    pub display_name: String,
    /// Latest RSSI reading (dBm, more negative is weaker)
    pub signal_strength: i16,
}

/// Result of comparing a reading against the proximity threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proximity {
    InProximity,
    OutOfProximity,
}

/// Single monotonic comparison, no hysteresis. A reading equal to the
/// threshold is in proximity.
pub fn classify(signal_strength: i16, threshold: i16) -> Proximity {
    if signal_strength >= threshold {
        Proximity::InProximity
    } else {
        Proximity::OutOfProximity
    }
}

#[derive(Debug, Clone)]
struct TrackedCandidate {
    candidate: BeaconCandidate,
    /// Discovery order, used as the ranking tie-break
    order: u64,
    readings: VecDeque<i16>,
}

/// One discovery window's worth of state
///
/// Keyed by device id. Rediscovery overwrites the signal strength only; the
/// display name recorded at first discovery is kept.
#[derive(Debug, Clone)]
pub struct ScanSession {
    active: bool,
    started_at: DateTime<Utc>,
    discovered: HashMap<String, TrackedCandidate>,
    next_order: u64,
    smoothing_window: usize,
}

impl ScanSession {
    /// `smoothing_window` of 0 or 1 classifies on the latest reading alone
    pub fn new(started_at: DateTime<Utc>, smoothing_window: usize) -> Self {
        Self {
            active: true,
            started_at,
            discovered: HashMap::new(),
            next_order: 0,
            smoothing_window: smoothing_window.max(1),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn len(&self) -> usize {
        self.discovered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.discovered.is_empty()
    }

    /// Freeze the session. Later upserts are ignored.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Insert or refresh a candidate. Returns the stored candidate, or `None`
    /// when the session is no longer active.
    pub fn upsert(
        &mut self,
        device_id: &str,
        display_name: &str,
        signal_strength: i16,
    ) -> Option<BeaconCandidate> {
        if !self.active {
            return None;
        }

        let window = self.smoothing_window;
        if !self.discovered.contains_key(device_id) {
            self.discovered.insert(
                device_id.to_string(),
                TrackedCandidate {
                    candidate: BeaconCandidate {
                        device_id: device_id.to_string(),
                        display_name: display_name.to_string(),
                        signal_strength,
                    },
                    order: self.next_order,
                    readings: VecDeque::with_capacity(window),
                },
            );
            self.next_order += 1;
        }

        let tracked = self.discovered.get_mut(device_id)?;
        tracked.candidate.signal_strength = signal_strength;
        tracked.readings.push_back(signal_strength);
        while tracked.readings.len() > window {
            tracked.readings.pop_front();
        }

        Some(tracked.candidate.clone())
    }

    pub fn get(&self, device_id: &str) -> Option<&BeaconCandidate> {
        self.discovered.get(device_id).map(|t| &t.candidate)
    }

    /// All candidates in discovery order
    pub fn candidates(&self) -> Vec<BeaconCandidate> {
        let mut tracked: Vec<&TrackedCandidate> = self.discovered.values().collect();
        tracked.sort_by_key(|t| t.order);
        tracked.into_iter().map(|t| t.candidate.clone()).collect()
    }

    /// Strength used for classification: the mean of the retained readings,
    /// which is just the latest reading when smoothing is off
    pub fn effective_strength(&self, device_id: &str) -> Option<i16> {
        let tracked = self.discovered.get(device_id)?;
        Some(effective(tracked))
    }

    pub fn classify(&self, device_id: &str, threshold: i16) -> Option<Proximity> {
        self.effective_strength(device_id)
            .map(|strength| classify(strength, threshold))
    }

    /// In-proximity candidates, strongest first. Equal strengths keep
    /// discovery order (first discovered ranks higher).
    pub fn ranked(&self, threshold: i16) -> Vec<BeaconCandidate> {
        let mut passing: Vec<(i16, u64, &BeaconCandidate)> = self
            .discovered
            .values()
            .map(|t| (effective(t), t.order, &t.candidate))
            .filter(|(strength, _, _)| classify(*strength, threshold) == Proximity::InProximity)
            .collect();
        passing.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        passing.into_iter().map(|(_, _, c)| c.clone()).collect()
    }

    /// Strongest in-proximity candidate; `None` when nothing passes
    pub fn best_candidate(&self, threshold: i16) -> Option<BeaconCandidate> {
        self.ranked(threshold).into_iter().next()
    }
}

fn effective(tracked: &TrackedCandidate) -> i16 {
    if tracked.readings.len() <= 1 {
        return tracked.candidate.signal_strength;
    }
    let sum: i32 = tracked.readings.iter().map(|r| i32::from(*r)).sum();
    let mean = f64::from(sum) / tracked.readings.len() as f64;
    mean.round() as i16
}
