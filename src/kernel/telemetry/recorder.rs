use std::collections::VecDeque;

use super::event::{DropReason, TelemetryEvent};
use super::metrics::{compute_snapshot, TelemetrySnapshot};
use crate::kernel::track::{TrackId, TrackState};

const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded log of recent fusion telemetry. Oldest entries are evicted first
/// and counted, so aggregate stats stay honest about the window they cover.
#[derive(Debug)]
pub struct TelemetryRecorder {
    log: VecDeque<TelemetryEvent>,
    capacity: usize,
    evicted: u64,
}

impl Default for TelemetryRecorder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            log: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            evicted: 0,
        }
    }

    pub fn record(&mut self, event: TelemetryEvent) {
        while self.log.len() >= self.capacity {
            self.log.pop_front();
            self.evicted += 1;
        }
        self.log.push_back(event);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        compute_snapshot(&self.log)
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Entries pushed out of the window so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Lifecycle states one track went through, in order, starting from spawn.
    pub fn track_history(&self, track_id: TrackId) -> Vec<TrackState> {
        let mut history = Vec::new();
        for event in &self.log {
            match event {
                TelemetryEvent::TrackSpawned { track_id: id, .. } if *id == track_id => {
                    history.push(TrackState::Tentative);
                }
                TelemetryEvent::TrackTransition { track_id: id, to, .. } if *id == track_id => {
                    history.push(*to);
                }
                _ => {}
            }
        }
        history
    }

    /// Observations from one camera rejected for `reason`.
    pub fn drops_for(&self, camera_id: &str, reason: DropReason) -> usize {
        self.log
            .iter()
            .filter(|e| {
                matches!(e, TelemetryEvent::ObservationDropped { camera_id: c, reason: r }
                    if c == camera_id && *r == reason)
            })
            .count()
    }
}
