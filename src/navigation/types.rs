use serde::{Deserialize, Serialize};

use crate::kernel::event::{EntityClass, RobotId};
use crate::kernel::geometry::Position;
use crate::kernel::time::Timestamp;
use crate::kernel::track::TrackId;
use crate::kernel::zone::ZoneId;

/// A robot's active goal: the path it intends to drive, from its current position on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotGoal {
    pub robot_id: RobotId,
    #[serde(default)]
    pub path: Vec<Position>,
    #[serde(default)]
    pub target_zone: Option<ZoneId>,
}

impl RobotGoal {
    pub fn new(robot_id: &str, path: Vec<Position>) -> Self {
        Self {
            robot_id: robot_id.to_string(),
            path,
            target_zone: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    Proceed,
    Slow,
    Reroute,
    Stop,
}

impl Directive {
    /// Higher is more conservative.
    pub fn rank(self) -> u8 {
        match self {
            Directive::Proceed => 0,
            Directive::Slow => 1,
            Directive::Reroute => 2,
            Directive::Stop => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Clear,
    RobotNotLocalized,
    CoverageGap,
    ReducedCoverage,
    OperatorOverride,
    ForbiddenZone,
    ForbiddenZoneAhead,
    IntruderInner,
    IntruderOuter,
    UnresolvedPerson,
    PathBlocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hazard {
    pub track_id: TrackId,
    pub kind: EntityClass,
    pub distance_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceCommand {
    pub robot_id: RobotId,
    pub directive: Directive,
    /// Speed cap in m/s; zero for `stop`.
    pub speed_cap: f64,
    pub reason: ReasonCode,
    #[serde(default)]
    pub reroute_via: Option<ZoneId>,
    #[serde(default)]
    pub hazard: Option<Hazard>,
    pub model_timestamp: Timestamp,
    pub model_generation: u64,
}

impl GuidanceCommand {
    /// Same instruction, ignoring which snapshot produced it.
    pub fn same_instruction(&self, other: &GuidanceCommand) -> bool {
        self.robot_id == other.robot_id
            && self.directive == other.directive
            && (self.speed_cap - other.speed_cap).abs() < 1e-3
            && self.reason == other.reason
            && self.reroute_via == other.reroute_via
            && self.hazard.as_ref().map(|h| h.track_id) == other.hazard.as_ref().map(|h| h.track_id)
    }
}

/// Operator-side inputs to the arbitrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationControl {
    SetGoal(RobotGoal),
    ClearGoal { robot_id: RobotId },
    /// The robot acknowledged the command built from this snapshot time.
    Acknowledge { robot_id: RobotId, model_timestamp: Timestamp },
    /// Allow creeping through an uncovered zone.
    Override { zone_id: ZoneId, expires_at: Option<Timestamp> },
    ClearOverride { zone_id: ZoneId },
}
