use serde::{Deserialize, Serialize};

use crate::kernel::event::{CameraId, SystemEventKind};
use crate::kernel::snapshot::CoverageLevel;
use crate::kernel::time::Tick;
use crate::kernel::track::{TrackId, TrackState};
use crate::kernel::zone::ZoneId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryEvent {
    ObservationFused {
        track_id: TrackId,
        camera_id: CameraId,
    },

    ObservationDropped {
        camera_id: CameraId,
        reason: DropReason,
    },

    TrackSpawned {
        track_id: TrackId,
        tick: Tick,
    },

    TrackTransition {
        track_id: TrackId,
        from: TrackState,
        to: TrackState,
    },

    TracksMerged {
        survivor: TrackId,
        absorbed: TrackId,
    },

    AmbiguousAssociation {
        margin: f64,
    },

    CameraQuarantined {
        camera_id: CameraId,
    },

    CameraReleased {
        camera_id: CameraId,
    },

    CoverageChanged {
        zone_id: ZoneId,
        from: CoverageLevel,
        to: CoverageLevel,
    },

    SystemEventDropped {
        kind: SystemEventKind,
        source: String,
    },

    CycleCompleted {
        tick: Tick,
        events: usize,
        live_tracks: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    Stale,
    Malformed,
    Quarantined,
}
