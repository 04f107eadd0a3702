use std::path::PathBuf;
use thiserror::Error;

use crate::kernel::event::{CameraId, Severity, SystemEventKind};
use crate::kernel::time::Timestamp;

/// Runtime error taxonomy of the fusion core.
#[derive(Error, Debug)]
pub enum FusionError {
    #[error("stale observation from {camera_id}: {age_ms}ms old")]
    StaleObservation { camera_id: CameraId, age_ms: u64 },

    #[error("malformed observation from {camera_id}: {reason}")]
    MalformedObservation { camera_id: CameraId, reason: MalformedReason },

    #[error("camera {camera_id} is quarantined until acknowledged")]
    CameraQuarantined { camera_id: CameraId },

    #[error("ambiguous association for {camera_id} (score margin {margin:.3})")]
    AssociationAmbiguous { camera_id: CameraId, margin: f64 },

    #[error("bus publish failed after {attempts} attempts: {source}")]
    BusPublishFailure {
        attempts: u32,
        #[source]
        source: PublishError,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl FusionError {
    /// SystemEvent raised for this error, if it is reported at all.
    pub fn event_kind(&self) -> Option<SystemEventKind> {
        match self {
            FusionError::StaleObservation { .. } => Some(SystemEventKind::StaleObservation),
            FusionError::MalformedObservation { .. } => Some(SystemEventKind::MalformedObservation),
            FusionError::CameraQuarantined { .. } => Some(SystemEventKind::CameraQuarantined),
            FusionError::AssociationAmbiguous { .. } => Some(SystemEventKind::AssociationAmbiguous),
            FusionError::BusPublishFailure { .. } => Some(SystemEventKind::BusPublishFailure),
            FusionError::Config(_) => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            FusionError::AssociationAmbiguous { .. } => Severity::Info,
            FusionError::CameraQuarantined { .. } | FusionError::BusPublishFailure { .. } => Severity::Critical,
            _ => Severity::Warning,
        }
    }

    /// Camera the error is attributed to.
    pub fn camera_id(&self) -> Option<&str> {
        match self {
            FusionError::StaleObservation { camera_id, .. }
            | FusionError::MalformedObservation { camera_id, .. }
            | FusionError::CameraQuarantined { camera_id }
            | FusionError::AssociationAmbiguous { camera_id, .. } => Some(camera_id),
            FusionError::BusPublishFailure { .. } | FusionError::Config(_) => None,
        }
    }
}

/// Why an observation was rejected as malformed.
#[derive(Debug, Clone, PartialEq)]
pub enum MalformedReason {
    EmptyCameraId,
    NonFiniteCoordinates,
    OutOfBounds,
    InvalidExtent,
    ConfidenceOutOfRange(f32),
    UnknownClass(String),
    FutureTimestamp { ahead_ms: u64 },
}

impl std::fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedReason::EmptyCameraId => write!(f, "empty camera id"),
            MalformedReason::NonFiniteCoordinates => write!(f, "non-finite coordinates"),
            MalformedReason::OutOfBounds => write!(f, "coordinates outside world bounds"),
            MalformedReason::InvalidExtent => write!(f, "invalid extent"),
            MalformedReason::ConfidenceOutOfRange(c) => write!(f, "confidence {} outside [0,1]", c),
            MalformedReason::UnknownClass(label) => write!(f, "unknown class '{}'", label),
            MalformedReason::FutureTimestamp { ahead_ms } => write!(f, "timestamp {}ms in the future", ahead_ms),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no zones loaded")]
    NoZones,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("camera {camera_id} is not calibrated")]
    NotCalibrated { camera_id: CameraId },

    #[error("calibration for {camera_id} expired at {expired_at}")]
    Expired { camera_id: CameraId, expired_at: Timestamp },

    #[error("calibration for {camera_id} is not valid before {valid_from}")]
    NotYetValid { camera_id: CameraId, valid_from: Timestamp },

    #[error("degenerate calibration for {camera_id}: {reason}")]
    Degenerate { camera_id: CameraId, reason: String },

    #[error("cannot decode calibration for {camera_id}: {reason}")]
    Decode { camera_id: CameraId, reason: String },

    #[error("calibration store unavailable: {0}")]
    Store(String),
}

impl CalibrationError {
    pub fn event_kind(&self) -> SystemEventKind {
        match self {
            CalibrationError::NotCalibrated { .. } | CalibrationError::NotYetValid { .. } => {
                SystemEventKind::CalibrationMissing
            }
            CalibrationError::Expired { .. } => SystemEventKind::CalibrationExpired,
            CalibrationError::Degenerate { .. }
            | CalibrationError::Decode { .. }
            | CalibrationError::Store(_) => SystemEventKind::CalibrationRejected,
        }
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("bus I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus rejected message: {0}")]
    Rejected(String),
}
