use serde::{Deserialize, Serialize};

use crate::kernel::event::{CameraId, RobotId, TaskId};
use crate::kernel::geometry::{Extent, Orientation};
use crate::kernel::time::Timestamp;

/// One captured frame's worth of inference output for a single camera.
/// An empty `detections` list is still proof of life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub camera_id: CameraId,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
}

/// Detection box in the camera's own frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum LocalBox {
    /// Image-space box (pixels), projected onto the floor plane.
    Pixel {
        u_min: f64,
        v_min: f64,
        u_max: f64,
        v_max: f64,
    },
    /// Metric box centred at `(x, y, z)` in the camera frame.
    Metric {
        x: f64,
        y: f64,
        z: f64,
        width: f64,
        depth: f64,
        height: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawDetection {
    Classified {
        class: String,
        bbox: LocalBox,
        confidence: f32,
    },
    Marker {
        robot_id: RobotId,
        #[serde(default)]
        task_id: Option<TaskId>,
        /// Marker position in the camera frame (metres).
        position: [f64; 3],
        #[serde(default)]
        orientation: Orientation,
        confidence: f32,
        #[serde(default)]
        extent: Option<Extent>,
    },
}

impl RawDetection {
    pub fn confidence(&self) -> f32 {
        match self {
            RawDetection::Classified { confidence, .. } | RawDetection::Marker { confidence, .. } => *confidence,
        }
    }
}

/// Per-adapter counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterStats {
    pub frames: u64,
    pub detections: u64,
    pub emitted: u64,
    pub below_floor: u64,
    /// Frames rejected for missing or expired calibration.
    pub uncalibrated: u64,
    pub unprojectable: u64,
    /// Frames addressed to another camera.
    pub foreign: u64,
    pub overloads: u64,
}
