use std::collections::{BTreeMap, VecDeque};

use super::event::{DropReason, TelemetryEvent};
use crate::kernel::event::CameraId;
use crate::kernel::snapshot::CoverageLevel;
use crate::kernel::track::TrackState;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub observation_stats: ObservationStats,
    pub track_stats: TrackStats,
    pub camera_stats: CameraStats,
    pub cycle_stats: CycleStats,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationStats {
    pub fused: u64,
    pub stale: u64,
    pub malformed: u64,
    pub quarantined: u64,
    pub ambiguous: u64,
    pub min_ambiguity_margin: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackStats {
    pub spawned: u64,
    pub confirmed: u64,
    pub coasting: u64,
    pub lost: u64,
    pub merged: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraStats {
    pub malformed_by_camera: BTreeMap<CameraId, u64>,
    pub stale_by_camera: BTreeMap<CameraId, u64>,
    pub quarantines: u64,
    pub releases: u64,
    pub coverage_gaps: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleStats {
    pub cycles: u64,
    pub total_events: u64,
    pub avg_events_per_cycle: f64,
    pub max_live_tracks: usize,
    /// SystemEvents lost to a full event queue.
    pub dropped_system_events: u64,
}

pub fn compute_snapshot(events: &VecDeque<TelemetryEvent>) -> TelemetrySnapshot {
    let mut snap = TelemetrySnapshot::default();

    for event in events {
        match event {
            TelemetryEvent::ObservationFused { .. } => snap.observation_stats.fused += 1,
            TelemetryEvent::ObservationDropped { camera_id, reason } => match reason {
                DropReason::Stale => {
                    snap.observation_stats.stale += 1;
                    *snap.camera_stats.stale_by_camera.entry(camera_id.clone()).or_insert(0) += 1;
                }
                DropReason::Malformed => {
                    snap.observation_stats.malformed += 1;
                    *snap.camera_stats.malformed_by_camera.entry(camera_id.clone()).or_insert(0) += 1;
                }
                DropReason::Quarantined => snap.observation_stats.quarantined += 1,
            },
            TelemetryEvent::TrackSpawned { .. } => snap.track_stats.spawned += 1,
            TelemetryEvent::TrackTransition { to, .. } => match to {
                TrackState::Confirmed => snap.track_stats.confirmed += 1,
                TrackState::Coasting => snap.track_stats.coasting += 1,
                TrackState::Lost => snap.track_stats.lost += 1,
                TrackState::Tentative => {}
            },
            TelemetryEvent::TracksMerged { .. } => snap.track_stats.merged += 1,
            TelemetryEvent::AmbiguousAssociation { margin } => {
                snap.observation_stats.ambiguous += 1;
                let min = snap.observation_stats.min_ambiguity_margin.get_or_insert(*margin);
                if *margin < *min {
                    *min = *margin;
                }
            }
            TelemetryEvent::CameraQuarantined { .. } => snap.camera_stats.quarantines += 1,
            TelemetryEvent::CameraReleased { .. } => snap.camera_stats.releases += 1,
            TelemetryEvent::CoverageChanged { to, .. } => {
                if *to == CoverageLevel::None {
                    snap.camera_stats.coverage_gaps += 1;
                }
            }
            TelemetryEvent::SystemEventDropped { .. } => snap.cycle_stats.dropped_system_events += 1,
            TelemetryEvent::CycleCompleted { events, live_tracks, .. } => {
                snap.cycle_stats.cycles += 1;
                snap.cycle_stats.total_events += *events as u64;
                snap.cycle_stats.max_live_tracks = snap.cycle_stats.max_live_tracks.max(*live_tracks);
            }
        }
    }

    if snap.cycle_stats.cycles > 0 {
        snap.cycle_stats.avg_events_per_cycle =
            snap.cycle_stats.total_events as f64 / snap.cycle_stats.cycles as f64;
    }

    snap
}
