use std::sync::Arc;

use aether_fusion::config::{FusionConfig, NavigationConfig};
use aether_fusion::kernel::event::{AccuracyClass, EntityClass, Liveness, Observation, SystemEventKind};
use aether_fusion::kernel::geometry::{Extent, Polygon, Position, Velocity};
use aether_fusion::kernel::snapshot::WorldModel;
use aether_fusion::kernel::time::Timestamp;
use aether_fusion::kernel::track::TrackState;
use aether_fusion::kernel::zone::{RiskCategory, Zone};
use aether_fusion::navigation::{Directive, NavigationArbitrator, NavigationControl, ReasonCode, RobotGoal};
use aether_fusion::FusionEngine;

const T0: u64 = 1_700_000_000_000;
const ROBOT: &str = "ATR-23";

fn now() -> Timestamp {
    Timestamp::from_millis(T0 + 50)
}

fn zone(id: &str, rect: (f64, f64, f64, f64), risk: RiskCategory, cameras: &[&str]) -> Zone {
    Zone::new(
        id,
        Polygon::rectangle(rect.0, rect.1, rect.2, rect.3),
        risk,
        cameras.iter().map(|c| c.to_string()).collect(),
    )
}

fn entity(camera: &str, x: f64, y: f64, label: &str, confidence: f32, extent: Extent) -> Observation {
    Observation {
        camera_id: camera.to_string(),
        timestamp: Timestamp::from_millis(T0),
        position: Position::new(x, y, extent.height / 2.0),
        extent,
        class: label.to_string(),
        confidence,
        robot_id: None,
        task_id: None,
        pose: None,
        velocity: None,
        accuracy: AccuracyClass::High,
        trust: 1.0,
    }
}

fn person(x: f64, y: f64, confidence: f32) -> Observation {
    entity("cam-b", x, y, "person", confidence, Extent::new(0.5, 0.5, 1.8))
}

fn robot_at(x: f64, y: f64) -> Observation {
    Observation {
        robot_id: Some(ROBOT.to_string()),
        trust: 1.5,
        ..entity("cam-a", x, y, "robot", 0.95, Extent::new(0.9, 0.7, 1.2))
    }
}

/// Fuse one batch of observations and return the resulting snapshot.
fn world(zones: Vec<Zone>, observations: Vec<Observation>, offline: &[&str]) -> Arc<WorldModel> {
    let mut engine = FusionEngine::new(FusionConfig::default(), zones);
    engine.register_camera("cam-a");
    engine.register_camera("cam-b");
    for obs in observations {
        engine.ingest(obs, now()).unwrap();
    }
    for camera in offline {
        engine.set_camera_liveness(camera, Liveness::Offline, now());
    }
    engine.end_cycle(now());
    engine.snapshot(now())
}

fn restricted_cell() -> Vec<Zone> {
    vec![zone("cell", (0.0, 0.0, 10.0, 10.0), RiskCategory::Restricted, &["cam-a", "cam-b"])]
}

fn goal(path: Vec<Position>) -> RobotGoal {
    RobotGoal::new(ROBOT, path)
}

#[test]
fn test_person_close_in_restricted_zone_stops_robot() {
    // Person footprint edge 1.5 m from the robot; restricted zones scale the
    // 2 m person threshold by 1.5.
    let model = world(restricted_cell(), vec![robot_at(2.0, 5.0), person(3.75, 5.0, 0.95)], &[]);
    let mut arbitrator = NavigationArbitrator::new(NavigationConfig::default());
    arbitrator.set_goal(goal(vec![Position::planar(8.0, 5.0)]));

    let first = arbitrator.evaluate_all(&model);
    assert_eq!(first.commands.len(), 1);
    let command = &first.commands[0];
    assert_eq!(command.directive, Directive::Stop);
    assert_eq!(command.reason, ReasonCode::IntruderInner);
    assert_eq!(command.speed_cap, 0.0);
    let hazard = command.hazard.as_ref().expect("stop names the hazard");
    assert_eq!(hazard.kind, EntityClass::Person);
    assert!((hazard.distance_m - 1.5).abs() < 1e-6);
    assert_eq!(command.model_generation, model.generation);
    assert_eq!(
        first.events.iter().filter(|e| e.kind == SystemEventKind::HazardProximity).count(),
        1
    );

    // Same hazard on the next snapshot: guidance repeats, the alert does not.
    let second = arbitrator.evaluate_all(&model);
    assert_eq!(second.commands.len(), 1);
    assert!(second.changed.is_empty());
    assert!(second.events.is_empty());
}

#[test]
fn test_unresolved_person_never_yields_proceed() {
    let model = world(restricted_cell(), vec![robot_at(1.0, 5.0), person(5.25, 5.0, 0.35)], &[]);
    let arbitrator = NavigationArbitrator::new(NavigationConfig::default());
    let command = arbitrator
        .evaluate(&model, &goal(vec![Position::planar(1.0, 1.0)]))
        .unwrap();
    assert_ne!(command.directive, Directive::Proceed);
    assert_eq!(command.reason, ReasonCode::UnresolvedPerson);
    assert!(command.speed_cap <= NavigationConfig::default().min_creep_speed + 1e-9);
}

#[test]
fn test_outer_band_slows_proportionally() {
    let zones = vec![zone("aisle", (0.0, 0.0, 20.0, 10.0), RiskCategory::Free, &["cam-a", "cam-b"])];
    let model = world(zones, vec![robot_at(2.0, 5.0), person(5.25, 5.0, 0.9)], &[]);
    let arbitrator = NavigationArbitrator::new(NavigationConfig::default());
    let command = arbitrator
        .evaluate(&model, &goal(vec![Position::planar(2.0, 1.0)]))
        .unwrap();
    assert_eq!(command.directive, Directive::Slow);
    assert_eq!(command.reason, ReasonCode::IntruderOuter);
    // 3 m clearance, halfway between the 2 m and 4 m bands of a 2 m/s zone.
    assert!((command.speed_cap - 1.0).abs() < 1e-6, "cap = {}", command.speed_cap);
}

#[test]
fn test_clear_floor_proceeds_at_zone_speed() {
    let zones = vec![zone("aisle", (0.0, 0.0, 20.0, 10.0), RiskCategory::Caution, &["cam-a"])];
    let model = world(zones, vec![robot_at(2.0, 5.0)], &[]);
    let arbitrator = NavigationArbitrator::new(NavigationConfig::default());
    let command = arbitrator
        .evaluate(&model, &goal(vec![Position::planar(10.0, 5.0)]))
        .unwrap();
    assert_eq!(command.directive, Directive::Proceed);
    assert_eq!(command.reason, ReasonCode::Clear);
    assert!((command.speed_cap - 1.2).abs() < 1e-9);
}

#[test]
fn test_unlocalized_robot_is_stopped() {
    let model = world(restricted_cell(), vec![person(5.0, 5.0, 0.9)], &[]);
    let arbitrator = NavigationArbitrator::new(NavigationConfig::default());
    let command = arbitrator.evaluate(&model, &goal(vec![])).unwrap();
    assert_eq!(command.directive, Directive::Stop);
    assert_eq!(command.reason, ReasonCode::RobotNotLocalized);
}

#[test]
fn test_coverage_gap_stops_unless_overridden() {
    let model = world(restricted_cell(), vec![robot_at(2.0, 5.0)], &["cam-a", "cam-b"]);
    let mut arbitrator = NavigationArbitrator::new(NavigationConfig::default());
    let path = goal(vec![Position::planar(2.0, 8.0)]);

    let command = arbitrator.evaluate(&model, &path).unwrap();
    assert_eq!(command.directive, Directive::Stop);
    assert_eq!(command.reason, ReasonCode::CoverageGap);

    arbitrator.apply(NavigationControl::Override {
        zone_id: "cell".to_string(),
        expires_at: None,
    });
    let overridden = arbitrator.evaluate(&model, &path).unwrap();
    assert_eq!(overridden.directive, Directive::Slow);
    assert_eq!(overridden.reason, ReasonCode::OperatorOverride);
    assert!((overridden.speed_cap - 0.3).abs() < 1e-9);

    arbitrator.record_override("cell", Some(model.timestamp));
    let expired = arbitrator.evaluate(&model, &path).unwrap();
    assert_eq!(expired.directive, Directive::Stop);
}

#[test]
fn test_reduced_coverage_slows() {
    let model = world(restricted_cell(), vec![robot_at(2.0, 5.0)], &["cam-b"]);
    let arbitrator = NavigationArbitrator::new(NavigationConfig::default());
    let command = arbitrator
        .evaluate(&model, &goal(vec![Position::planar(2.0, 8.0)]))
        .unwrap();
    assert_eq!(command.directive, Directive::Slow);
    assert_eq!(command.reason, ReasonCode::ReducedCoverage);
    assert!((command.speed_cap - 0.3).abs() < 1e-9);
}

#[test]
fn test_forbidden_zone_ahead_stops() {
    let zones = vec![
        zone("aisle", (0.0, 0.0, 20.0, 10.0), RiskCategory::Free, &["cam-a"]),
        zone("press", (6.0, 0.0, 8.0, 10.0), RiskCategory::Forbidden, &["cam-a"]),
    ];
    let model = world(zones, vec![robot_at(3.0, 5.0)], &[]);
    let arbitrator = NavigationArbitrator::new(NavigationConfig::default());

    let command = arbitrator
        .evaluate(&model, &goal(vec![Position::planar(12.0, 5.0)]))
        .unwrap();
    assert_eq!(command.directive, Directive::Stop);
    assert_eq!(command.reason, ReasonCode::ForbiddenZoneAhead);

    let away = arbitrator
        .evaluate(&model, &goal(vec![Position::planar(0.5, 5.0)]))
        .unwrap();
    assert_eq!(away.directive, Directive::Proceed);
}

#[test]
fn test_blocked_path_reroutes_through_clear_zone() {
    let pallet = entity("cam-a", 6.0, 5.0, "pallet", 0.9, Extent::new(1.0, 1.0, 1.0));
    let zones = vec![
        zone("aisle-a", (0.0, 0.0, 20.0, 10.0), RiskCategory::Free, &["cam-a"]),
        zone("aisle-b", (0.0, 10.0, 20.0, 20.0), RiskCategory::Free, &["cam-a"]),
    ];
    let model = world(zones, vec![robot_at(2.0, 5.0), pallet.clone()], &[]);
    let arbitrator = NavigationArbitrator::new(NavigationConfig::default());

    let mut path = goal(vec![Position::planar(12.0, 5.0)]);
    path.target_zone = Some("aisle-b".to_string());
    let command = arbitrator.evaluate(&model, &path).unwrap();
    assert_eq!(command.directive, Directive::Reroute);
    assert_eq!(command.reason, ReasonCode::PathBlocked);
    assert_eq!(command.reroute_via.as_deref(), Some("aisle-b"));
    assert_eq!(command.hazard.as_ref().map(|h| h.kind), Some(EntityClass::Obstacle));

    let single = vec![zone("aisle-a", (0.0, 0.0, 20.0, 10.0), RiskCategory::Free, &["cam-a"])];
    let boxed_in = world(single, vec![robot_at(2.0, 5.0), pallet], &[]);
    let stuck = arbitrator
        .evaluate(&boxed_in, &goal(vec![Position::planar(12.0, 5.0)]))
        .unwrap();
    assert_eq!(stuck.directive, Directive::Stop);
    assert_eq!(stuck.reason, ReasonCode::PathBlocked);
}

#[test]
fn test_snapshot_older_than_acknowledged_command_is_skipped() {
    let model = world(restricted_cell(), vec![robot_at(2.0, 5.0)], &[]);
    let mut arbitrator = NavigationArbitrator::new(NavigationConfig::default());
    let path = goal(vec![Position::planar(2.0, 8.0)]);

    arbitrator.acknowledge(ROBOT, model.timestamp.plus_millis(100));
    assert!(arbitrator.evaluate(&model, &path).is_none());

    // Acknowledgements never move backwards.
    arbitrator.acknowledge(ROBOT, model.timestamp);
    assert_eq!(arbitrator.last_acknowledged(ROBOT), Some(model.timestamp.plus_millis(100)));
}

#[test]
fn test_changed_guidance_is_reported_once() {
    let model = world(restricted_cell(), vec![robot_at(2.0, 5.0)], &[]);
    let mut arbitrator = NavigationArbitrator::new(NavigationConfig::default());
    arbitrator.set_goal(goal(vec![Position::planar(2.0, 8.0)]));

    assert_eq!(arbitrator.evaluate_all(&model).changed.len(), 1);
    let again = arbitrator.evaluate_all(&model);
    assert_eq!(again.commands.len(), 1);
    assert!(again.changed.is_empty());

    arbitrator.clear_goal(ROBOT);
    assert!(arbitrator.evaluate_all(&model).commands.is_empty());
}

#[test]
fn test_robot_off_zoned_floor_stops_when_its_cameras_go_dark() {
    // Only zone ends at x = 10; the robot sits on unzoned floor.
    let zones = vec![zone("cell", (0.0, 0.0, 10.0, 10.0), RiskCategory::Free, &["cam-a"])];
    let path = goal(vec![Position::planar(18.0, 5.0)]);
    let arbitrator = NavigationArbitrator::new(NavigationConfig::default());

    let seen = world(zones.clone(), vec![robot_at(15.0, 5.0)], &[]);
    let command = arbitrator.evaluate(&seen, &path).unwrap();
    assert_eq!(command.directive, Directive::Proceed);

    let dark = world(zones, vec![robot_at(15.0, 5.0)], &["cam-a"]);
    let robot = dark.robot_track(ROBOT).expect("robot still tracked while coasting");
    assert_eq!(robot.state, TrackState::Coasting);
    let command = arbitrator.evaluate(&dark, &path).unwrap();
    assert_eq!(command.directive, Directive::Stop);
    assert_eq!(command.reason, ReasonCode::CoverageGap);
    assert_eq!(command.speed_cap, 0.0);
}

#[test]
fn test_appearance_box_of_marked_robot_is_not_an_intruder() {
    let body = entity("cam-a", 2.05, 5.0, "robot", 0.9, Extent::new(0.9, 0.7, 1.2));
    let model = world(restricted_cell(), vec![robot_at(2.0, 5.0), body], &[]);
    assert_eq!(model.tracks.len(), 1);

    let arbitrator = NavigationArbitrator::new(NavigationConfig::default());
    let command = arbitrator
        .evaluate(&model, &goal(vec![Position::planar(2.0, 8.0)]))
        .unwrap();
    assert_eq!(command.directive, Directive::Proceed);
    assert!(command.hazard.is_none());
}

#[test]
fn test_moving_obstacle_keeps_a_wider_berth_than_a_static_one() {
    let zones = vec![zone("aisle", (0.0, 0.0, 20.0, 10.0), RiskCategory::Free, &["cam-a", "cam-b"])];
    let cart = |camera: &str, velocity: Option<Velocity>| Observation {
        velocity,
        ..entity(camera, 3.3, 5.0, "pallet", 0.9, Extent::new(1.0, 1.0, 1.0))
    };
    let path = goal(vec![Position::planar(2.0, 1.0)]);
    let arbitrator = NavigationArbitrator::new(NavigationConfig::default());

    // Footprint edge 0.8 m away: outside the static band, inside the moving one.
    let parked = world(zones.clone(), vec![robot_at(2.0, 5.0), cart("cam-b", None)], &[]);
    let command = arbitrator.evaluate(&parked, &path).unwrap();
    assert_eq!(command.directive, Directive::Slow);
    assert_eq!(command.reason, ReasonCode::IntruderOuter);

    let rolling = Some(Velocity::new(0.0, 0.6, 0.0));
    let moving = world(
        zones,
        vec![robot_at(2.0, 5.0), cart("cam-b", rolling), cart("cam-a", rolling)],
        &[],
    );
    let command = arbitrator.evaluate(&moving, &path).unwrap();
    assert_eq!(command.directive, Directive::Stop);
    assert_eq!(command.reason, ReasonCode::IntruderInner);
    assert_eq!(command.hazard.as_ref().map(|h| h.kind), Some(EntityClass::Obstacle));
}
