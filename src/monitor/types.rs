use serde::{Deserialize, Serialize};

use crate::kernel::event::{CameraId, Liveness};
use crate::kernel::time::Timestamp;

/// Objective liveness evidence sent by adapters. Carries no detection content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthSignal {
    /// A raw frame arrived, with or without detections.
    Frame { camera_id: CameraId, at: Timestamp },

    /// The adapter's input closed or it was torn down.
    Disconnected { camera_id: CameraId, at: Timestamp },
}

impl HealthSignal {
    pub fn camera_id(&self) -> &str {
        match self {
            HealthSignal::Frame { camera_id, .. } | HealthSignal::Disconnected { camera_id, .. } => camera_id,
        }
    }
}

/// A liveness transition decided by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub camera_id: CameraId,
    pub from: Liveness,
    pub to: Liveness,
    pub at: Timestamp,
    /// Silence that triggered an Offline transition; zero for disconnects and recoveries.
    pub silent_ms: u64,
}
