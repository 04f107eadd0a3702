use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::event::{CameraId, Liveness, RobotId};
use super::geometry::Position;
use super::time::Timestamp;
use super::track::{Track, TrackId, TrackState};
use super::zone::{Zone, ZoneId};

/// How well a zone is currently observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageLevel {
    /// Every covering camera is live.
    Full,
    /// Some covering cameras are down. Readers should treat the zone with reduced confidence.
    Reduced,
    /// No live covering camera. Nothing inside can be assumed clear.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCoverage {
    pub camera_id: CameraId,
    pub liveness: Liveness,
    pub last_observation: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneCoverage {
    pub zone_id: ZoneId,
    pub level: CoverageLevel,
    pub live_cameras: Vec<CameraId>,
}

/// Immutable, versioned view of the fused world.
///
/// Produced once per fusion cycle and shared behind an `Arc`; readers never
/// observe a partially updated model. Timestamps and generations never decrease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldModel {
    pub generation: u64,
    pub timestamp: Timestamp,
    pub tracks: Vec<Track>,
    pub zones: Arc<Vec<Zone>>,
    pub cameras: Vec<CameraCoverage>,
    pub coverage: Vec<ZoneCoverage>,
}

impl WorldModel {
    /// Generation-zero model: no tracks, and every zone uncovered until the first cycle.
    pub fn empty(zones: Vec<Zone>) -> Self {
        let coverage = zones
            .iter()
            .map(|z| ZoneCoverage {
                zone_id: z.id.clone(),
                level: CoverageLevel::None,
                live_cameras: Vec::new(),
            })
            .collect();
        Self {
            generation: 0,
            timestamp: Timestamp::ZERO,
            tracks: Vec::new(),
            zones: Arc::new(zones),
            cameras: Vec::new(),
            coverage,
        }
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// The marker-identified track for a robot, if it is currently tracked.
    pub fn robot_track(&self, robot_id: &str) -> Option<&Track> {
        self.tracks
            .iter()
            .filter(|t| t.kind.robot_id().map(String::as_str) == Some(robot_id))
            .max_by_key(|t| t.last_update)
    }

    pub fn live_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| t.state != TrackState::Lost)
    }

    /// Tracks other than the given robot's own.
    pub fn intruders<'a>(&'a self, robot_id: &'a RobotId) -> impl Iterator<Item = &'a Track> + 'a {
        self.live_tracks()
            .filter(move |t| t.kind.robot_id() != Some(robot_id))
    }

    pub fn zone(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    pub fn zones_at<'a>(&'a self, p: &'a Position) -> impl Iterator<Item = &'a Zone> + 'a {
        self.zones.iter().filter(move |z| z.contains(p))
    }

    /// Unknown zones report no coverage.
    pub fn coverage_of(&self, zone_id: &str) -> CoverageLevel {
        self.coverage
            .iter()
            .find(|c| c.zone_id == zone_id)
            .map(|c| c.level)
            .unwrap_or(CoverageLevel::None)
    }

    pub fn camera_liveness(&self, camera_id: &str) -> Option<Liveness> {
        self.cameras
            .iter()
            .find(|c| c.camera_id == camera_id)
            .map(|c| c.liveness)
    }
}
