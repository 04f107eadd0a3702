use serde::{Deserialize, Serialize};

use super::event::CameraId;
use super::geometry::{Polygon, Position};

pub type ZoneId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Forbidden,
    Restricted,
    Caution,
    Free,
}

impl RiskCategory {
    /// Higher is more restrictive.
    pub fn rank(self) -> u8 {
        match self {
            RiskCategory::Free => 0,
            RiskCategory::Caution => 1,
            RiskCategory::Restricted => 2,
            RiskCategory::Forbidden => 3,
        }
    }

    pub fn default_policy(self) -> SpeedPolicy {
        match self {
            RiskCategory::Free => SpeedPolicy { max_speed: 2.0, proximity_scale: 1.0 },
            RiskCategory::Caution => SpeedPolicy { max_speed: 1.2, proximity_scale: 1.2 },
            RiskCategory::Restricted => SpeedPolicy { max_speed: 0.6, proximity_scale: 1.5 },
            RiskCategory::Forbidden => SpeedPolicy { max_speed: 0.0, proximity_scale: 2.0 },
        }
    }
}

/// Speed-scaling policy attached to a zone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedPolicy {
    /// Speed cap inside the zone (m/s).
    pub max_speed: f64,
    /// Multiplier applied to every proximity threshold inside the zone.
    pub proximity_scale: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    #[serde(default)]
    pub name: String,
    pub polygon: Polygon,
    pub risk: RiskCategory,
    /// Falls back to the risk category's default when absent from config.
    #[serde(default)]
    pub policy: Option<SpeedPolicy>,
    /// Cameras whose field of view covers this zone.
    #[serde(default)]
    pub cameras: Vec<CameraId>,
}

impl Zone {
    pub fn new(id: &str, polygon: Polygon, risk: RiskCategory, cameras: Vec<CameraId>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            polygon,
            risk,
            policy: None,
            cameras,
        }
    }

    pub fn with_policy(mut self, policy: SpeedPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn effective_policy(&self) -> SpeedPolicy {
        self.policy.unwrap_or_else(|| self.risk.default_policy())
    }

    pub fn contains(&self, p: &Position) -> bool {
        self.polygon.contains(p)
    }
}
