use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{Directive, GuidanceCommand, Hazard, NavigationControl, ReasonCode, RobotGoal};
use crate::config::NavigationConfig;
use crate::kernel::event::{EntityClass, Liveness, RobotId, Severity, SystemEvent, SystemEventKind};
use crate::kernel::geometry::{polyline_distance, sample_polyline, truncate_polyline, Position};
use crate::kernel::snapshot::{CoverageLevel, WorldModel};
use crate::kernel::time::Timestamp;
use crate::kernel::track::{Track, TrackState};
use crate::kernel::zone::{RiskCategory, SpeedPolicy, Zone, ZoneId};

#[derive(Debug, Clone)]
struct Finding {
    directive: Directive,
    cap: f64,
    reason: ReasonCode,
    hazard: Option<Hazard>,
    reroute_via: Option<ZoneId>,
}

impl Finding {
    fn new(directive: Directive, cap: f64, reason: ReasonCode) -> Self {
        Self {
            directive,
            cap,
            reason,
            hazard: None,
            reroute_via: None,
        }
    }

    fn stop(reason: ReasonCode) -> Self {
        Self::new(Directive::Stop, 0.0, reason)
    }

    fn with_hazard(mut self, track: &Track, distance_m: f64) -> Self {
        self.hazard = Some(Hazard {
            track_id: track.id,
            kind: track.class(),
            distance_m,
        });
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct OverrideGrant {
    expires_at: Option<Timestamp>,
}

/// Result of evaluating one snapshot for every robot with a goal.
#[derive(Debug, Clone, Default)]
pub struct Arbitration {
    pub commands: Vec<GuidanceCommand>,
    /// Commands whose instruction differs from the last one issued to that robot.
    pub changed: Vec<GuidanceCommand>,
    pub events: Vec<SystemEvent>,
}

/// Turns world snapshots and robot goals into guidance.
///
/// Holds no history beyond acknowledged-command freshness and operator
/// overrides. Every rule can only make the outcome more conservative.
#[derive(Debug)]
pub struct NavigationArbitrator {
    config: NavigationConfig,
    goals: BTreeMap<RobotId, RobotGoal>,
    acknowledged: BTreeMap<RobotId, Timestamp>,
    overrides: BTreeMap<ZoneId, OverrideGrant>,
    last_issued: BTreeMap<RobotId, GuidanceCommand>,
}

impl NavigationArbitrator {
    pub fn new(config: NavigationConfig) -> Self {
        Self {
            config,
            goals: BTreeMap::new(),
            acknowledged: BTreeMap::new(),
            overrides: BTreeMap::new(),
            last_issued: BTreeMap::new(),
        }
    }

    pub fn set_goal(&mut self, goal: RobotGoal) {
        info!("Goal set for '{}' ({} waypoints)", goal.robot_id, goal.path.len());
        self.goals.insert(goal.robot_id.clone(), goal);
    }

    pub fn clear_goal(&mut self, robot_id: &str) {
        self.goals.remove(robot_id);
        self.last_issued.remove(robot_id);
    }

    pub fn goals(&self) -> impl Iterator<Item = &RobotGoal> {
        self.goals.values()
    }

    /// Record that a robot acted on the command built from `model_timestamp`.
    /// Acknowledgements never move backwards.
    pub fn acknowledge(&mut self, robot_id: &str, model_timestamp: Timestamp) {
        let entry = self.acknowledged.entry(robot_id.to_string()).or_insert(model_timestamp);
        if model_timestamp > *entry {
            *entry = model_timestamp;
        }
    }

    pub fn last_acknowledged(&self, robot_id: &str) -> Option<Timestamp> {
        self.acknowledged.get(robot_id).copied()
    }

    pub fn record_override(&mut self, zone_id: &str, expires_at: Option<Timestamp>) {
        warn!("Operator override recorded for zone '{}'", zone_id);
        self.overrides.insert(zone_id.to_string(), OverrideGrant { expires_at });
    }

    pub fn clear_override(&mut self, zone_id: &str) {
        self.overrides.remove(zone_id);
    }

    pub fn apply(&mut self, control: NavigationControl) {
        match control {
            NavigationControl::SetGoal(goal) => self.set_goal(goal),
            NavigationControl::ClearGoal { robot_id } => self.clear_goal(&robot_id),
            NavigationControl::Acknowledge { robot_id, model_timestamp } => self.acknowledge(&robot_id, model_timestamp),
            NavigationControl::Override { zone_id, expires_at } => self.record_override(&zone_id, expires_at),
            NavigationControl::ClearOverride { zone_id } => self.clear_override(&zone_id),
        }
    }

    fn override_active(&self, zone_id: &str, at: Timestamp) -> bool {
        self.overrides
            .get(zone_id)
            .is_some_and(|g| g.expires_at.map_or(true, |until| at < until))
    }

    /// Guidance for one robot, or `None` when the snapshot predates the robot's
    /// last acknowledged command.
    pub fn evaluate(&self, model: &WorldModel, goal: &RobotGoal) -> Option<GuidanceCommand> {
        if self
            .acknowledged
            .get(&goal.robot_id)
            .is_some_and(|acked| model.timestamp < *acked)
        {
            debug!("Snapshot {} older than last ack for '{}'; skipped", model.timestamp, goal.robot_id);
            return None;
        }

        let finding = match model.robot_track(&goal.robot_id) {
            Some(robot) => self.arbitrate(model, goal, robot),
            None => Finding::stop(ReasonCode::RobotNotLocalized),
        };

        Some(GuidanceCommand {
            robot_id: goal.robot_id.clone(),
            directive: finding.directive,
            speed_cap: if finding.directive == Directive::Stop { 0.0 } else { finding.cap.max(0.0) },
            reason: finding.reason,
            reroute_via: finding.reroute_via,
            hazard: finding.hazard,
            model_timestamp: model.timestamp,
            model_generation: model.generation,
        })
    }

    fn arbitrate(&self, model: &WorldModel, goal: &RobotGoal, robot: &Track) -> Finding {
        let cfg = &self.config;
        let here = robot.volume.center;
        let zones_here: Vec<&Zone> = model.zones_at(&here).collect();
        let policy = Self::governing_policy(&zones_here, cfg.default_policy);
        let mut findings = vec![Finding::new(Directive::Proceed, policy.max_speed, ReasonCode::Clear)];

        // === 1. COVERAGE ===
        for zone in &zones_here {
            match model.coverage_of(&zone.id) {
                CoverageLevel::None if self.override_active(&zone.id, model.timestamp) => {
                    findings.push(Finding::new(Directive::Slow, cfg.override_speed_cap, ReasonCode::OperatorOverride));
                }
                CoverageLevel::None => findings.push(Finding::stop(ReasonCode::CoverageGap)),
                CoverageLevel::Reduced => findings.push(Finding::new(
                    Directive::Slow,
                    policy.max_speed * cfg.reduced_coverage_factor,
                    ReasonCode::ReducedCoverage,
                )),
                CoverageLevel::Full => {}
            }
        }
        // The robot's own pose needs a live camera unless an operator accepted the gap.
        let overridden = zones_here.iter().any(|z| self.override_active(&z.id, model.timestamp));
        let unverified = zones_here.is_empty() || robot.state != TrackState::Confirmed;
        if unverified && !overridden && !Self::robot_observed(model, robot) {
            findings.push(Finding::stop(ReasonCode::CoverageGap));
        }

        // === 2. FORBIDDEN ZONES ===
        if zones_here.iter().any(|z| z.risk == RiskCategory::Forbidden) {
            findings.push(Finding::stop(ReasonCode::ForbiddenZone));
        }
        let mut route = Vec::with_capacity(goal.path.len() + 1);
        route.push(here);
        route.extend(goal.path.iter().copied());
        let ahead = truncate_polyline(&route, cfg.lookahead_m);
        let forbidden_ahead = sample_polyline(&ahead, cfg.path_sample_step_m)
            .iter()
            .any(|p| model.zones_at(p).any(|z| z.risk == RiskCategory::Forbidden));
        if forbidden_ahead {
            findings.push(Finding::stop(ReasonCode::ForbiddenZoneAhead));
        }

        // === 3. INTRUDERS ===
        let mut blockers: Vec<&Track> = Vec::new();
        for track in model.intruders(&goal.robot_id) {
            let threshold = cfg.thresholds.for_kind(&track.kind);
            let inner = threshold.inner * policy.proximity_scale;
            let outer = threshold.outer * policy.proximity_scale;
            let distance = track.volume.planar_clearance(&here);
            let unresolved_person =
                track.class() == EntityClass::Person && track.confidence < cfg.person_confidence_floor;

            if distance <= inner {
                findings.push(Finding::stop(ReasonCode::IntruderInner).with_hazard(track, distance));
            } else if distance <= outer {
                let (cap, reason) = if unresolved_person {
                    (cfg.min_creep_speed, ReasonCode::UnresolvedPerson)
                } else {
                    let ratio = (distance - inner) / (outer - inner);
                    ((policy.max_speed * ratio).max(cfg.min_creep_speed), ReasonCode::IntruderOuter)
                };
                findings.push(Finding::new(Directive::Slow, cap, reason).with_hazard(track, distance));
            } else if ahead.len() > 1 && polyline_distance(&track.volume.center, &ahead) <= inner {
                blockers.push(track);
            }
        }

        if let Some(nearest) = blockers
            .iter()
            .min_by(|a, b| {
                a.volume
                    .planar_clearance(&here)
                    .total_cmp(&b.volume.planar_clearance(&here))
            })
        {
            let distance = nearest.volume.planar_clearance(&here);
            let zone_ids: Vec<&str> = zones_here.iter().map(|z| z.id.as_str()).collect();
            let finding = match self.clear_alternative(model, goal, &here, &zone_ids) {
                Some(zone_id) => Finding {
                    reroute_via: Some(zone_id),
                    ..Finding::new(Directive::Reroute, policy.max_speed, ReasonCode::PathBlocked)
                },
                None => Finding::stop(ReasonCode::PathBlocked),
            };
            findings.push(finding.with_hazard(nearest, distance));
        }

        Self::most_conservative(findings)
    }

    /// Whether any camera that has seen the robot track is still live.
    fn robot_observed(model: &WorldModel, robot: &Track) -> bool {
        robot
            .cameras()
            .any(|camera| model.camera_liveness(camera) == Some(Liveness::Online))
    }

    /// Most restrictive policy among the zones at a point; unzoned floor uses the default.
    fn governing_policy(zones: &[&Zone], default: SpeedPolicy) -> SpeedPolicy {
        if zones.is_empty() {
            return default;
        }
        zones.iter().map(|z| z.effective_policy()).fold(
            SpeedPolicy {
                max_speed: f64::INFINITY,
                proximity_scale: 0.0,
            },
            |acc, p| SpeedPolicy {
                max_speed: acc.max_speed.min(p.max_speed),
                proximity_scale: acc.proximity_scale.max(p.proximity_scale),
            },
        )
    }

    /// Nearest fully covered, non-forbidden zone with no intruder in or near it.
    /// The goal's target zone wins when it qualifies.
    fn clear_alternative(&self, model: &WorldModel, goal: &RobotGoal, here: &Position, current: &[&str]) -> Option<ZoneId> {
        let is_clear = |zone: &Zone| {
            zone.risk != RiskCategory::Forbidden
                && !current.contains(&zone.id.as_str())
                && model.coverage_of(&zone.id) == CoverageLevel::Full
                && model.intruders(&goal.robot_id).all(|t| {
                    let inner = self.config.thresholds.for_kind(&t.kind).inner;
                    !zone.contains(&t.volume.center) && zone.polygon.edge_distance(&t.volume.center) > inner
                })
        };

        if let Some(target) = goal.target_zone.as_deref().and_then(|id| model.zone(id)) {
            if is_clear(target) {
                return Some(target.id.clone());
            }
        }
        model
            .zones
            .iter()
            .filter(|z| is_clear(*z))
            .min_by(|a, b| {
                a.polygon
                    .centroid()
                    .planar_distance(here)
                    .total_cmp(&b.polygon.centroid().planar_distance(here))
            })
            .map(|z| z.id.clone())
    }

    /// stop > reroute > slow > proceed; the first finding of the winning rank
    /// supplies the reason. Caps combine as a minimum.
    fn most_conservative(findings: Vec<Finding>) -> Finding {
        let cap = findings.iter().map(|f| f.cap).fold(f64::INFINITY, f64::min);
        let mut winner = findings
            .into_iter()
            .reduce(|best, f| if f.directive.rank() > best.directive.rank() { f } else { best })
            .unwrap_or_else(|| Finding::stop(ReasonCode::RobotNotLocalized));
        winner.cap = cap;
        winner
    }

    /// Evaluate every robot with a goal. Hazard alerts fire when a robot is first
    /// stopped for a given intruder.
    pub fn evaluate_all(&mut self, model: &WorldModel) -> Arbitration {
        let mut out = Arbitration::default();
        let commands: Vec<GuidanceCommand> = self.goals.values().filter_map(|g| self.evaluate(model, g)).collect();

        for command in commands {
            let previous = self.last_issued.get(&command.robot_id);
            if command.reason == ReasonCode::IntruderInner {
                let repeat = previous.is_some_and(|p| {
                    p.reason == ReasonCode::IntruderInner
                        && p.hazard.as_ref().map(|h| h.track_id) == command.hazard.as_ref().map(|h| h.track_id)
                });
                if let (false, Some(hazard)) = (repeat, command.hazard.as_ref()) {
                    warn!(
                        "Hazard: '{}' stopped for track {} ({:?}) at {:.2}m",
                        command.robot_id, hazard.track_id, hazard.kind, hazard.distance_m
                    );
                    out.events.push(SystemEvent::new(
                        SystemEventKind::HazardProximity,
                        Severity::Critical,
                        command.robot_id.as_str(),
                        format!(
                            "{:?} track {} within {:.2}m",
                            hazard.kind, hazard.track_id, hazard.distance_m
                        ),
                        model.timestamp,
                    ));
                }
            }
            if !previous.is_some_and(|p| p.same_instruction(&command)) {
                out.changed.push(command.clone());
            }
            self.last_issued.insert(command.robot_id.clone(), command.clone());
            out.commands.push(command);
        }
        out
    }

    /// Arbitration task: evaluates on every new snapshot and on a fixed tick.
    /// New snapshots publish only changed guidance; the tick republishes everything.
    pub async fn run(
        mut self,
        mut snapshots: watch::Receiver<Arc<WorldModel>>,
        mut control: mpsc::Receiver<NavigationControl>,
        guidance: mpsc::Sender<GuidanceCommand>,
        events: mpsc::Sender<SystemEvent>,
        cancel: CancellationToken,
    ) {
        info!("Navigation arbitration started. Tick: {}ms", self.config.tick_interval_ms);
        let mut cadence = interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut control_open = true;

        loop {
            let (model, republish) = tokio::select! {
                _ = cancel.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        info!("Snapshot channel closed; navigation stopping");
                        break;
                    }
                    let model = snapshots.borrow_and_update().clone();
                    (model, false)
                }
                _ = cadence.tick() => {
                    let model = snapshots.borrow().clone();
                    (model, true)
                }
                ctrl = control.recv(), if control_open => {
                    match ctrl {
                        Some(ctrl) => self.apply(ctrl),
                        None => control_open = false,
                    }
                    continue;
                }
            };

            let arbitration = self.evaluate_all(&model);
            let outgoing = if republish { arbitration.commands } else { arbitration.changed };
            for event in arbitration.events {
                let _ = events.send(event).await;
            }
            for command in outgoing {
                if guidance.send(command).await.is_err() {
                    info!("Guidance channel closed; navigation stopping");
                    return;
                }
            }
        }
        info!("Navigation arbitration stopped");
    }
}
