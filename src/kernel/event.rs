use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::geometry::{Extent, Pose, Position, Velocity};
use super::time::Timestamp;
use super::zone::Zone;

pub type CameraId = String;
pub type RobotId = String;
pub type TaskId = String;

/// Coarse class of the camera transform accuracy, carried on every observation
/// so the fusion step can weight it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyClass {
    High,
    Medium,
    Low,
}

impl AccuracyClass {
    /// Bucket a world-frame calibration accuracy (metres).
    pub fn from_metres(accuracy_m: f64) -> Self {
        if accuracy_m <= 0.05 {
            AccuracyClass::High
        } else if accuracy_m <= 0.15 {
            AccuracyClass::Medium
        } else {
            AccuracyClass::Low
        }
    }

    pub fn weight(self) -> f64 {
        match self {
            AccuracyClass::High => 1.0,
            AccuracyClass::Medium => 0.7,
            AccuracyClass::Low => 0.4,
        }
    }

    /// One-sigma positional uncertainty contributed by the transform.
    pub fn sigma_m(self) -> f64 {
        match self {
            AccuracyClass::High => 0.05,
            AccuracyClass::Medium => 0.15,
            AccuracyClass::Low => 0.35,
        }
    }
}

/// The fused entity taxonomy. Raw class labels map onto it through config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    Robot,
    Person,
    Obstacle,
    Unknown,
}

impl EntityClass {
    /// Same class, or either side unresolved.
    pub fn compatible_with(self, other: EntityClass) -> bool {
        self == other || self == EntityClass::Unknown || other == EntityClass::Unknown
    }
}

/// A single camera's detection of an entity in one frame, in world coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub camera_id: CameraId,
    pub timestamp: Timestamp,
    pub position: Position,
    pub extent: Extent,
    /// Raw class label as produced by the inference provider.
    pub class: String,
    pub confidence: f32,
    #[serde(default)]
    pub robot_id: Option<RobotId>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub pose: Option<Pose>,
    #[serde(default)]
    pub velocity: Option<Velocity>,
    pub accuracy: AccuracyClass,
    /// Marker detections carry more trust than appearance-only ones.
    #[serde(default = "default_trust")]
    pub trust: f32,
}

fn default_trust() -> f32 {
    1.0
}

impl Observation {
    pub fn is_marker(&self) -> bool {
        self.robot_id.is_some()
    }

    /// Fusion weight: confidence x calibration accuracy x trust.
    pub fn weight(&self) -> f64 {
        f64::from(self.confidence.clamp(0.0, 1.0)) * self.accuracy.weight() * f64::from(self.trust.max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEventKind {
    CalibrationMissing,
    CalibrationExpired,
    CalibrationRejected,
    CalibrationRestored,
    StaleObservation,
    MalformedObservation,
    CameraQuarantined,
    CameraReleased,
    CameraOffline,
    CameraOnline,
    CoverageGap,
    CoverageRestored,
    AssociationAmbiguous,
    MailboxOverload,
    HazardProximity,
    BusPublishFailure,
    PublisherHalted,
    ZonesReloaded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: Uuid,
    pub kind: SystemEventKind,
    pub severity: Severity,
    pub source: String,
    pub message: String,
    pub timestamp: Timestamp,
}

impl SystemEvent {
    pub fn new(
        kind: SystemEventKind,
        severity: Severity,
        source: impl Into<String>,
        message: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            source: source.into(),
            message: message.into(),
            timestamp,
        }
    }
}

/// Per-camera liveness as seen by the fusion core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Online,
    Offline,
    /// Excluded by the fusion engine after repeated malformed input.
    Quarantined,
}

/// Mailbox message for the single-writer fusion reactor.
/// Everything that mutates the world state arrives through here, in order.
#[derive(Debug, Clone)]
pub enum Event {
    Observation(Observation),
    /// Liveness change reported by the health monitor.
    CameraStatus { camera_id: CameraId, liveness: Liveness, at: Timestamp },
    /// Operator acknowledgement releasing a quarantined camera.
    Acknowledge { camera_id: CameraId },
    ZonesReloaded(Vec<Zone>),
}
