use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use super::event::{CameraId, Liveness};
use super::snapshot::{CameraCoverage, CoverageLevel, ZoneCoverage};
use super::time::{Tick, Timestamp};
use super::track::{Track, TrackId};
use super::zone::{Zone, ZoneId};

/// Strict state delta for everything outside the track table.
#[derive(Debug, Clone)]
pub enum StateDelta {
    CameraLiveness { camera_id: CameraId, liveness: Liveness },
    ObservationAccepted { camera_id: CameraId, at: Timestamp },
    MalformedInput { camera_id: CameraId, at: Timestamp },
    MalformedCleared { camera_id: CameraId },
    ZonesReplaced(Vec<Zone>),
    Tick(Tick),
}

#[derive(Debug, Clone)]
pub struct CameraRecord {
    pub liveness: Liveness,
    pub last_observation: Option<Timestamp>,
    malformed: VecDeque<Timestamp>,
}

impl CameraRecord {
    fn new(liveness: Liveness) -> Self {
        Self {
            liveness,
            last_observation: None,
            malformed: VecDeque::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.liveness == Liveness::Online
    }

    /// Malformed inputs recorded within `window_ms` of `now`.
    pub fn malformed_within(&self, now: Timestamp, window_ms: u64) -> usize {
        self.malformed
            .iter()
            .filter(|at| now.millis_since(**at) <= window_ms)
            .count()
    }
}

/// The fusion core's single mutable world.
///
/// Owned by the reactor task. Tracks are keyed by id in a `BTreeMap` so every
/// pass over them runs in a deterministic order.
#[derive(Debug, Clone, Default)]
pub struct WorldState {
    pub(crate) tracks: BTreeMap<TrackId, Track>,
    pub(crate) next_track_id: TrackId,
    cameras: BTreeMap<CameraId, CameraRecord>,
    zones: Arc<Vec<Zone>>,
    coverage: BTreeMap<ZoneId, CoverageLevel>,
    pub last_tick: Tick,
    /// Bumped on every reduction.
    pub version: u64,
}

impl WorldState {
    pub fn new(zones: Vec<Zone>) -> Self {
        Self {
            next_track_id: 1,
            zones: Arc::new(zones),
            ..Default::default()
        }
    }

    pub fn reduce(&mut self, delta: StateDelta) {
        self.version += 1;
        match delta {
            StateDelta::CameraLiveness { camera_id, liveness } => {
                self.cameras
                    .entry(camera_id)
                    .and_modify(|c| c.liveness = liveness)
                    .or_insert_with(|| CameraRecord::new(liveness));
            }
            StateDelta::ObservationAccepted { camera_id, at } => {
                let record = self
                    .cameras
                    .entry(camera_id)
                    .or_insert_with(|| CameraRecord::new(Liveness::Online));
                if record.last_observation.map_or(true, |prev| at > prev) {
                    record.last_observation = Some(at);
                }
            }
            StateDelta::MalformedInput { camera_id, at } => {
                self.cameras
                    .entry(camera_id)
                    .or_insert_with(|| CameraRecord::new(Liveness::Online))
                    .malformed
                    .push_back(at);
            }
            StateDelta::MalformedCleared { camera_id } => {
                if let Some(record) = self.cameras.get_mut(&camera_id) {
                    record.malformed.clear();
                }
            }
            StateDelta::ZonesReplaced(zones) => {
                self.coverage.retain(|id, _| zones.iter().any(|z| &z.id == id));
                self.zones = Arc::new(zones);
            }
            StateDelta::Tick(tick) => self.last_tick = tick,
        }
    }

    /// Forget malformed inputs older than the window.
    pub fn prune_malformed(&mut self, now: Timestamp, window_ms: u64) {
        for record in self.cameras.values_mut() {
            while record
                .malformed
                .front()
                .is_some_and(|at| now.millis_since(*at) > window_ms)
            {
                record.malformed.pop_front();
            }
        }
    }

    pub fn camera(&self, camera_id: &str) -> Option<&CameraRecord> {
        self.cameras.get(camera_id)
    }

    pub fn liveness(&self, camera_id: &str) -> Option<Liveness> {
        self.cameras.get(camera_id).map(|c| c.liveness)
    }

    pub fn zones(&self) -> &Arc<Vec<Zone>> {
        &self.zones
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub(crate) fn allocate_track_id(&mut self) -> TrackId {
        let id = self.next_track_id.max(1);
        self.next_track_id = id + 1;
        id
    }

    /// Coverage of every zone from current camera liveness. Cameras never seen count as down.
    pub fn compute_coverage(&self) -> Vec<ZoneCoverage> {
        self.zones
            .iter()
            .map(|zone| {
                let live_cameras: Vec<CameraId> = zone
                    .cameras
                    .iter()
                    .filter(|c| self.cameras.get(*c).is_some_and(CameraRecord::is_live))
                    .cloned()
                    .collect();
                let level = if live_cameras.is_empty() {
                    CoverageLevel::None
                } else if live_cameras.len() < zone.cameras.len() {
                    CoverageLevel::Reduced
                } else {
                    CoverageLevel::Full
                };
                ZoneCoverage {
                    zone_id: zone.id.clone(),
                    level,
                    live_cameras,
                }
            })
            .collect()
    }

    /// Store the new coverage, returning `(zone, previous, current)` for each change.
    /// `previous` is `None` the first time a zone is evaluated.
    pub fn update_coverage(
        &mut self,
        current: &[ZoneCoverage],
    ) -> Vec<(ZoneId, Option<CoverageLevel>, CoverageLevel)> {
        let mut changes = Vec::new();
        for entry in current {
            let previous = self.coverage.insert(entry.zone_id.clone(), entry.level);
            if previous != Some(entry.level) {
                changes.push((entry.zone_id.clone(), previous, entry.level));
            }
        }
        changes
    }

    pub fn camera_coverage(&self) -> Vec<CameraCoverage> {
        self.cameras
            .iter()
            .map(|(id, record)| CameraCoverage {
                camera_id: id.clone(),
                liveness: record.liveness,
                last_observation: record.last_observation,
            })
            .collect()
    }
}
