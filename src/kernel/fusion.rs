//! Track fusion engine.
//!
//! Sole owner of the track table. Every observation passes through
//! validate -> gate -> associate -> update; once per cycle `end_cycle` runs
//! conflict resolution, lifecycle and coverage bookkeeping.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::event::{
    CameraId, EntityClass, Liveness, Observation, Severity, SystemEvent, SystemEventKind,
};
use super::snapshot::{CoverageLevel, WorldModel};
use super::state::{StateDelta, WorldState};
use super::telemetry::{DropReason, TelemetryEvent, TelemetryRecorder, TelemetrySnapshot};
use super::time::{Tick, Timestamp};
use super::track::{Track, TrackId, TrackState};
use super::zone::Zone;
use crate::config::{validate_zones, FusionConfig};
use crate::error::{FusionError, MalformedReason};

const SOURCE: &str = "fusion";

/// Outcome of a successfully ingested observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    Matched { track_id: TrackId },
    Spawned { track_id: TrackId },
}

impl Association {
    pub fn track_id(&self) -> TrackId {
        match self {
            Association::Matched { track_id } | Association::Spawned { track_id } => *track_id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    track_id: TrackId,
    score: f64,
    last_update: Timestamp,
}

pub struct FusionEngine {
    config: FusionConfig,
    state: WorldState,
    telemetry: TelemetryRecorder,
    /// Liveness last reported by the health monitor, restored on quarantine release.
    reported: BTreeMap<CameraId, Liveness>,
    pending: Vec<SystemEvent>,
    last_reported: HashMap<(CameraId, SystemEventKind), Timestamp>,
    generation: u64,
    last_snapshot: Timestamp,
}

impl FusionEngine {
    pub fn new(config: FusionConfig, zones: Vec<Zone>) -> Self {
        Self {
            config,
            state: WorldState::new(zones),
            telemetry: TelemetryRecorder::new(),
            reported: BTreeMap::new(),
            pending: Vec::new(),
            last_reported: HashMap::new(),
            generation: 0,
            last_snapshot: Timestamp::ZERO,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.state.tracks()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.state.track(id)
    }

    pub fn camera_liveness(&self, camera_id: &str) -> Option<Liveness> {
        self.state.liveness(camera_id)
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn recorder(&self) -> &TelemetryRecorder {
        &self.telemetry
    }

    /// Drain the SystemEvents raised since the last call.
    pub fn take_events(&mut self) -> Vec<SystemEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Declare a configured camera. Unknown cameras count as down for coverage.
    pub fn register_camera(&mut self, camera_id: &str) {
        if self.state.liveness(camera_id).is_none() {
            self.state.reduce(StateDelta::CameraLiveness {
                camera_id: camera_id.to_string(),
                liveness: Liveness::Online,
            });
        }
    }

    pub fn set_tick(&mut self, tick: Tick) {
        self.state.reduce(StateDelta::Tick(tick));
    }

    // === INGEST ===

    pub fn ingest(&mut self, obs: Observation, now: Timestamp) -> Result<Association, FusionError> {
        if self.state.liveness(&obs.camera_id) == Some(Liveness::Quarantined) {
            self.drop_observation(&obs.camera_id, DropReason::Quarantined);
            return Err(FusionError::CameraQuarantined { camera_id: obs.camera_id });
        }

        let class = match self.validate(&obs, now) {
            Ok(class) => class,
            Err(reason) => {
                debug!("Malformed observation from '{}': {}", obs.camera_id, reason);
                self.record_malformed(&obs.camera_id, now);
                let err = FusionError::MalformedObservation { camera_id: obs.camera_id, reason };
                self.report(&err, now);
                return Err(err);
            }
        };

        let age_ms = now.millis_since(obs.timestamp);
        if age_ms > self.config.max_observation_age_ms {
            debug!("Stale observation from '{}': {}ms old", obs.camera_id, age_ms);
            self.drop_observation(&obs.camera_id, DropReason::Stale);
            let err = FusionError::StaleObservation { camera_id: obs.camera_id, age_ms };
            self.report(&err, now);
            return Err(err);
        }

        self.state.reduce(StateDelta::ObservationAccepted {
            camera_id: obs.camera_id.clone(),
            at: obs.timestamp,
        });

        let association = match self.best_candidate(&obs, class, now) {
            Some(track_id) => {
                let transition = match self.state.tracks.get_mut(&track_id) {
                    Some(track) => track.absorb(&obs, class, &self.config),
                    None => None,
                };
                if let Some((from, to)) = transition {
                    self.record_transition(track_id, from, to);
                }
                Association::Matched { track_id }
            }
            None => {
                let track_id = self.state.allocate_track_id();
                self.state.tracks.insert(track_id, Track::spawn(track_id, &obs, class));
                self.telemetry.record(TelemetryEvent::TrackSpawned {
                    track_id,
                    tick: self.state.last_tick,
                });
                Association::Spawned { track_id }
            }
        };

        self.telemetry.record(TelemetryEvent::ObservationFused {
            track_id: association.track_id(),
            camera_id: obs.camera_id,
        });
        Ok(association)
    }

    fn validate(&self, obs: &Observation, now: Timestamp) -> Result<EntityClass, MalformedReason> {
        if obs.camera_id.trim().is_empty() {
            return Err(MalformedReason::EmptyCameraId);
        }
        let finite = obs.position.is_finite()
            && obs.velocity.map_or(true, |v| v.is_finite())
            && obs
                .pose
                .map_or(true, |p| p.position.is_finite() && p.orientation.is_finite());
        if !finite {
            return Err(MalformedReason::NonFiniteCoordinates);
        }
        let b = &self.config.world_bounds;
        let p = &obs.position;
        if p.x < b.min_x || p.x > b.max_x || p.y < b.min_y || p.y > b.max_y || p.z < b.min_z || p.z > b.max_z {
            return Err(MalformedReason::OutOfBounds);
        }
        if !obs.extent.is_valid() {
            return Err(MalformedReason::InvalidExtent);
        }
        if !obs.confidence.is_finite() || !(0.0..=1.0).contains(&obs.confidence) {
            return Err(MalformedReason::ConfidenceOutOfRange(obs.confidence));
        }
        if obs.timestamp > now.plus_millis(self.config.future_tolerance_ms) {
            return Err(MalformedReason::FutureTimestamp {
                ahead_ms: obs.timestamp.millis_since(now),
            });
        }
        if obs.is_marker() {
            return Ok(EntityClass::Robot);
        }
        self.config
            .class_of(&obs.class)
            .ok_or_else(|| MalformedReason::UnknownClass(obs.class.clone()))
    }

    fn drop_observation(&mut self, camera_id: &str, reason: DropReason) {
        self.telemetry.record(TelemetryEvent::ObservationDropped {
            camera_id: camera_id.to_string(),
            reason,
        });
    }

    /// Raise the SystemEvent for an input error, at most once per camera and
    /// kind within `error_event_interval_ms`.
    fn report(&mut self, error: &FusionError, now: Timestamp) {
        let (Some(kind), Some(camera_id)) = (error.event_kind(), error.camera_id()) else {
            return;
        };
        let key = (camera_id.to_string(), kind);
        let interval = self.config.error_event_interval_ms;
        if self
            .last_reported
            .get(&key)
            .is_some_and(|last| now.millis_since(*last) < interval)
        {
            return;
        }
        self.pending.push(SystemEvent::new(kind, error.severity(), camera_id, error.to_string(), now));
        self.last_reported.insert(key, now);
    }

    fn record_malformed(&mut self, camera_id: &str, now: Timestamp) {
        self.drop_observation(camera_id, DropReason::Malformed);
        if camera_id.trim().is_empty() {
            return;
        }
        let window = self.config.quarantine_window_ms;
        self.state.prune_malformed(now, window);
        self.state.reduce(StateDelta::MalformedInput {
            camera_id: camera_id.to_string(),
            at: now,
        });
        let recent = self
            .state
            .camera(camera_id)
            .map_or(0, |c| c.malformed_within(now, window));
        if recent >= self.config.quarantine_threshold as usize {
            self.quarantine(camera_id, recent, now);
        }
    }

    fn quarantine(&mut self, camera_id: &str, recent: usize, now: Timestamp) {
        warn!(
            "Camera '{}' quarantined after {} malformed observations within {}ms",
            camera_id, recent, self.config.quarantine_window_ms
        );
        self.state.reduce(StateDelta::CameraLiveness {
            camera_id: camera_id.to_string(),
            liveness: Liveness::Quarantined,
        });
        self.telemetry.record(TelemetryEvent::CameraQuarantined {
            camera_id: camera_id.to_string(),
        });
        self.pending.push(SystemEvent::new(
            SystemEventKind::CameraQuarantined,
            Severity::Critical,
            camera_id,
            format!("{} malformed observations within {}ms; excluded until acknowledged", recent, self.config.quarantine_window_ms),
            now,
        ));
        self.degrade_camera(camera_id, now);
        self.refresh_coverage(now);
    }

    /// Operator acknowledgement. Returns false if the camera was not quarantined.
    pub fn acknowledge(&mut self, camera_id: &str, now: Timestamp) -> bool {
        if self.state.liveness(camera_id) != Some(Liveness::Quarantined) {
            return false;
        }
        let restored = self
            .reported
            .get(camera_id)
            .copied()
            .filter(|l| *l != Liveness::Quarantined)
            .unwrap_or(Liveness::Online);
        info!("Camera '{}' released from quarantine ({:?})", camera_id, restored);
        self.state.reduce(StateDelta::MalformedCleared { camera_id: camera_id.to_string() });
        self.state.reduce(StateDelta::CameraLiveness {
            camera_id: camera_id.to_string(),
            liveness: restored,
        });
        self.telemetry.record(TelemetryEvent::CameraReleased {
            camera_id: camera_id.to_string(),
        });
        self.pending.push(SystemEvent::new(
            SystemEventKind::CameraReleased,
            Severity::Info,
            camera_id,
            "released from quarantine by operator",
            now,
        ));
        self.refresh_coverage(now);
        true
    }

    // === GATING / ASSOCIATION ===

    fn compatible(track: &Track, obs: &Observation, class: EntityClass) -> bool {
        match (track.kind.robot_id(), obs.robot_id.as_ref()) {
            (Some(a), Some(b)) => a == b,
            (Some(_), None) => class.compatible_with(EntityClass::Robot),
            (None, Some(_)) => track.class().compatible_with(EntityClass::Robot),
            (None, None) => track.class().compatible_with(class),
        }
    }

    fn agreement(track: &Track, obs: &Observation, class: EntityClass) -> f64 {
        if track.kind.robot_id().is_some() && track.kind.robot_id() == obs.robot_id.as_ref() {
            1.0
        } else if track.class() == class {
            1.0
        } else {
            0.5
        }
    }

    /// Gate every live track and pick the best-scoring candidate.
    /// Ties go to the most recently updated track, then the lowest id.
    fn best_candidate(&mut self, obs: &Observation, class: EntityClass, now: Timestamp) -> Option<TrackId> {
        let cfg = &self.config;
        let obs_sigma = obs.accuracy.sigma_m();
        let mut candidates: Vec<Candidate> = self
            .state
            .tracks()
            .filter(|t| t.is_live())
            // One detection per camera frame per track.
            .filter(|t| t.contributors.get(&obs.camera_id) != Some(&obs.timestamp))
            .filter(|t| Self::compatible(t, obs, class))
            .filter(|t| obs.timestamp.abs_gap_millis(t.last_update) <= cfg.max_staleness_ms)
            .filter_map(|t| {
                let d = t.predicted_position(obs.timestamp).planar_distance(&obs.position);
                let sigma = t.uncertainty_at(obs.timestamp, cfg.coast_sigma_growth_m_per_s);
                let gate = cfg.gate_distance_m + cfg.gate_uncertainty_gain * (sigma * sigma + obs_sigma * obs_sigma).sqrt();
                (d <= gate).then(|| Candidate {
                    track_id: t.id,
                    score: cfg.w_distance / (1.0 + d)
                        + cfg.w_confidence * f64::from(t.confidence)
                        + cfg.w_class * Self::agreement(t, obs, class),
                    last_update: t.last_update,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.last_update.cmp(&a.last_update))
                .then_with(|| a.track_id.cmp(&b.track_id))
        });

        if let [best, runner_up, ..] = candidates.as_slice() {
            let margin = best.score - runner_up.score;
            if margin < self.config.ambiguity_margin {
                debug!(
                    "Ambiguous association for '{}': track {} over {} by {:.3}",
                    obs.camera_id, best.track_id, runner_up.track_id, margin
                );
                self.telemetry.record(TelemetryEvent::AmbiguousAssociation { margin });
                let err = FusionError::AssociationAmbiguous {
                    camera_id: obs.camera_id.clone(),
                    margin,
                };
                self.report(&err, now);
            }
        }

        candidates.first().map(|c| c.track_id)
    }

    fn record_transition(&mut self, track_id: TrackId, from: TrackState, to: TrackState) {
        debug!("Track {} {:?} -> {:?}", track_id, from, to);
        self.telemetry.record(TelemetryEvent::TrackTransition { track_id, from, to });
    }

    // === CAMERA LIVENESS ===

    /// Apply a liveness change from the health monitor. A quarantine stays in
    /// force until acknowledged, whatever the monitor reports.
    pub fn set_camera_liveness(&mut self, camera_id: &str, liveness: Liveness, at: Timestamp) {
        self.reported.insert(camera_id.to_string(), liveness);
        let current = self.state.liveness(camera_id);
        if current == Some(Liveness::Quarantined) || current == Some(liveness) {
            return;
        }
        self.state.reduce(StateDelta::CameraLiveness {
            camera_id: camera_id.to_string(),
            liveness,
        });
        if liveness != Liveness::Online {
            self.degrade_camera(camera_id, at);
        }
        self.refresh_coverage(at);
    }

    /// Sole-camera tracks go straight to Coasting; shared tracks lose the camera.
    fn degrade_camera(&mut self, camera_id: &str, at: Timestamp) {
        let mut transitions = Vec::new();
        for track in self.state.tracks.values_mut() {
            if track.is_sole_camera(camera_id) {
                if matches!(track.state, TrackState::Tentative | TrackState::Confirmed) {
                    transitions.push((track.id, track.state, TrackState::Coasting));
                    track.state = TrackState::Coasting;
                    track.coast(at, &self.config);
                }
            } else {
                track.drop_camera(camera_id);
            }
        }
        for (id, from, to) in transitions {
            self.record_transition(id, from, to);
        }
    }

    fn refresh_coverage(&mut self, now: Timestamp) {
        let coverage = self.state.compute_coverage();
        for (zone_id, previous, current) in self.state.update_coverage(&coverage) {
            if let Some(from) = previous {
                self.telemetry.record(TelemetryEvent::CoverageChanged {
                    zone_id: zone_id.clone(),
                    from,
                    to: current,
                });
            }
            match (previous, current) {
                (_, CoverageLevel::None) => {
                    warn!("Coverage gap in zone '{}'", zone_id);
                    self.pending.push(SystemEvent::new(
                        SystemEventKind::CoverageGap,
                        Severity::Critical,
                        zone_id.as_str(),
                        format!("zone {} has no live camera coverage", zone_id),
                        now,
                    ));
                }
                (Some(CoverageLevel::None), level) => {
                    info!("Coverage restored in zone '{}' ({:?})", zone_id, level);
                    self.pending.push(SystemEvent::new(
                        SystemEventKind::CoverageRestored,
                        Severity::Info,
                        zone_id.as_str(),
                        format!("zone {} coverage restored ({:?})", zone_id, level),
                        now,
                    ));
                }
                (Some(_), CoverageLevel::Reduced) => {
                    warn!("Coverage reduced in zone '{}'", zone_id);
                }
                _ => {}
            }
        }
    }

    // === ZONES ===

    /// Swap in a reloaded zone set. Invalid sets are rejected and the old one kept.
    pub fn replace_zones(&mut self, zones: Vec<Zone>, now: Timestamp) -> Result<(), FusionError> {
        if let Err(e) = validate_zones(&zones) {
            warn!("Zone reload rejected: {}", e);
            self.pending.push(SystemEvent::new(
                SystemEventKind::ZonesReloaded,
                Severity::Warning,
                SOURCE,
                format!("zone reload rejected: {}", e),
                now,
            ));
            return Err(e.into());
        }
        info!("Zones reloaded: {} zones", zones.len());
        let count = zones.len();
        self.state.reduce(StateDelta::ZonesReplaced(zones));
        self.pending.push(SystemEvent::new(
            SystemEventKind::ZonesReloaded,
            Severity::Info,
            SOURCE,
            format!("{} zones loaded", count),
            now,
        ));
        self.refresh_coverage(now);
        Ok(())
    }

    // === CYCLE ===

    /// Per-cycle bookkeeping: misses, merges, lifecycle, coverage.
    pub fn end_cycle(&mut self, now: Timestamp) {
        for track in self.state.tracks.values_mut() {
            if !track.matched_this_cycle {
                track.misses = track.misses.saturating_add(1);
            }
        }

        self.merge_overlapping(now);

        let cfg = &self.config;
        let mut transitions = Vec::new();
        let mut lost = Vec::new();
        for track in self.state.tracks.values_mut() {
            let from = track.state;
            let since_update = now.millis_since(track.last_update);
            let to = match from {
                TrackState::Tentative
                    if !track.matched_this_cycle
                        && now.millis_since(track.first_seen) > cfg.confirmation_window_ms =>
                {
                    TrackState::Lost
                }
                TrackState::Confirmed if since_update > cfg.coast_after_ms => TrackState::Coasting,
                TrackState::Coasting if since_update > cfg.coast_grace_ms => TrackState::Lost,
                state => state,
            };
            track.state = to;
            if to == TrackState::Coasting {
                track.coast(now, cfg);
            }
            if from != to {
                transitions.push((track.id, from, to));
            }
            if to == TrackState::Lost {
                lost.push(track.id);
            }
            track.prune_contributors(now, cfg.contributor_window_ms);
            track.matched_this_cycle = false;
        }

        for (id, from, to) in transitions {
            self.record_transition(id, from, to);
        }
        for id in lost {
            self.state.tracks.remove(&id);
        }

        self.state.prune_malformed(now, self.config.quarantine_window_ms);
        self.refresh_coverage(now);
    }

    fn mergeable(a: &Track, b: &Track, merge_distance: f64) -> bool {
        if !a.is_live() || !b.is_live() {
            return false;
        }
        if a.contributors.keys().any(|c| b.contributors.contains_key(c)) {
            return false;
        }
        let identity_ok = match (a.kind.robot_id(), b.kind.robot_id()) {
            (Some(x), Some(y)) => x == y,
            _ => true,
        };
        if !identity_ok || !a.class().compatible_with(b.class()) {
            return false;
        }
        a.volume.overlaps(&b.volume) || a.volume.center.planar_distance(&b.volume.center) <= merge_distance
    }

    /// An unidentified robot track overlapping a marker-locked one on a shared
    /// camera is the same vehicle seen by appearance in the same frames.
    fn shadows(marker: &Track, other: &Track) -> bool {
        marker.is_live()
            && other.is_live()
            && marker.kind.is_marker_locked()
            && !other.kind.is_marker_locked()
            && other.class() == EntityClass::Robot
            && marker.contributors.keys().any(|c| other.contributors.contains_key(c))
            && marker.volume.overlaps(&other.volume)
    }

    /// Merge duplicate tracks built from disjoint camera sets. The older id survives.
    /// Appearance shadows of a marker-locked robot fold into the marker track.
    fn merge_overlapping(&mut self, now: Timestamp) {
        loop {
            let pair = {
                let tracks: Vec<&Track> = self.state.tracks.values().collect();
                let mut found = None;
                'scan: for (i, a) in tracks.iter().enumerate() {
                    for b in &tracks[i + 1..] {
                        if Self::mergeable(a, b, self.config.merge_distance_m) {
                            found = Some(if (b.first_seen, b.id) < (a.first_seen, a.id) {
                                (b.id, a.id, false)
                            } else {
                                (a.id, b.id, false)
                            });
                            break 'scan;
                        }
                        if Self::shadows(a, b) {
                            found = Some((a.id, b.id, true));
                            break 'scan;
                        }
                        if Self::shadows(b, a) {
                            found = Some((b.id, a.id, true));
                            break 'scan;
                        }
                    }
                }
                found
            };

            let Some((survivor, absorbed, shadow)) = pair else {
                break;
            };
            let Some(other) = self.state.tracks.remove(&absorbed) else {
                break;
            };
            if let Some(track) = self.state.tracks.get_mut(&survivor) {
                let from = track.state;
                if shadow {
                    debug!("Folding appearance track {} into robot track {} at {}", absorbed, survivor, now);
                    track.absorb_shadow(other);
                } else {
                    debug!("Merging track {} into {} at {}", absorbed, survivor, now);
                    track.merge_from(other, &self.config);
                }
                let to = track.state;
                self.telemetry.record(TelemetryEvent::TracksMerged { survivor, absorbed });
                if from != to {
                    self.record_transition(survivor, from, to);
                }
            }
        }
    }

    // === SNAPSHOT ===

    /// Produce the next immutable world model. Generation and timestamp never go backwards.
    pub fn snapshot(&mut self, now: Timestamp) -> Arc<WorldModel> {
        let timestamp = now.max(self.last_snapshot);
        self.last_snapshot = timestamp;
        self.generation += 1;
        Arc::new(WorldModel {
            generation: self.generation,
            timestamp,
            tracks: self.state.tracks().cloned().collect(),
            zones: Arc::clone(self.state.zones()),
            cameras: self.state.camera_coverage(),
            coverage: self.state.compute_coverage(),
        })
    }

    /// Count a SystemEvent the driver could not hand on.
    pub fn record_event_dropped(&mut self, event: &SystemEvent) {
        self.telemetry.record(TelemetryEvent::SystemEventDropped {
            kind: event.kind,
            source: event.source.clone(),
        });
    }

    pub fn record_cycle(&mut self, tick: Tick, events: usize) {
        let live_tracks = self.state.tracks().filter(|t| t.is_live()).count();
        self.telemetry.record(TelemetryEvent::CycleCompleted { tick, events, live_tracks });
    }
}
