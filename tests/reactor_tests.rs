use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use aether_fusion::config::{FusionConfig, HealthConfig, NavigationConfig};
use aether_fusion::kernel::event::{AccuracyClass, Event, Liveness, Observation, SystemEventKind};
use aether_fusion::kernel::geometry::{Extent, Polygon, Position};
use aether_fusion::kernel::reactor::SideEffect;
use aether_fusion::kernel::snapshot::WorldModel;
use aether_fusion::kernel::time::Timestamp;
use aether_fusion::kernel::zone::{RiskCategory, Zone};
use aether_fusion::monitor::{HealthMonitor, HealthSignal};
use aether_fusion::navigation::{Directive, NavigationArbitrator, ReasonCode, RobotGoal};
use aether_fusion::{FusionEngine, Reactor};

const T0: u64 = 1_700_000_000_000;

fn zones() -> Vec<Zone> {
    vec![Zone::new(
        "bay",
        Polygon::rectangle(0.0, 0.0, 10.0, 10.0),
        RiskCategory::Caution,
        vec!["cam-a".to_string()],
    )]
}

fn person(camera: &str, at: Timestamp, x: f64) -> Observation {
    Observation {
        camera_id: camera.to_string(),
        timestamp: at,
        position: Position::new(x, 4.0, 0.9),
        extent: Extent::new(0.5, 0.5, 1.8),
        class: "person".to_string(),
        confidence: 0.9,
        robot_id: None,
        task_id: None,
        pose: None,
        velocity: None,
        accuracy: AccuracyClass::High,
        trust: 1.0,
    }
}

fn reactor() -> (Reactor, mpsc::Sender<Event>, watch::Receiver<Arc<WorldModel>>) {
    let (tx, rx) = mpsc::channel(100);
    let (snap_tx, snap_rx) = watch::channel(Arc::new(WorldModel::empty(zones())));
    let (events_tx, _events_rx) = mpsc::channel(100);
    let mut engine = FusionEngine::new(FusionConfig::default(), zones());
    engine.register_camera("cam-a");
    (Reactor::new(rx, engine, snap_tx, events_tx), tx, snap_rx)
}

fn published(effects: &[SideEffect]) -> Vec<Arc<WorldModel>> {
    effects
        .iter()
        .filter_map(|e| match e {
            SideEffect::Publish(model) => Some(Arc::clone(model)),
            SideEffect::Emit(_) => None,
        })
        .collect()
}

#[test]
fn test_tick_step_publishes_one_snapshot_per_cycle() {
    let (mut reactor, _tx, _rx) = reactor();
    let now = Timestamp::from_millis(T0);

    let effects = reactor.tick_step(now, vec![Event::Observation(person("cam-a", now, 3.0))]);
    assert_eq!(reactor.tick.frame, 1);
    let models = published(&effects);
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].generation, 1);
    assert_eq!(models[0].tracks.len(), 1);

    let idle = reactor.tick_step(now.plus_millis(33), vec![]);
    assert_eq!(reactor.tick.frame, 2);
    assert_eq!(published(&idle)[0].generation, 2);
}

#[test]
fn test_snapshot_time_is_monotonic_under_clock_skew() {
    let (mut reactor, _tx, _rx) = reactor();
    let later = reactor.tick_step(Timestamp::from_millis(T0 + 500), vec![]);
    let earlier = reactor.tick_step(Timestamp::from_millis(T0 + 100), vec![]);
    let a = &published(&later)[0];
    let b = &published(&earlier)[0];
    assert!(b.generation > a.generation);
    assert!(b.timestamp >= a.timestamp);
}

#[test]
fn test_batch_is_applied_in_arrival_order() {
    let (mut reactor, _tx, _rx) = reactor();
    let now = Timestamp::from_millis(T0);
    let mut batch: Vec<Event> = (0..5)
        .map(|i| Event::Observation(Observation {
            class: "giraffe".to_string(),
            ..person("cam-a", now.plus_millis(i), 3.0)
        }))
        .collect();
    // Arrives after the quarantine, so it is rejected.
    batch.push(Event::Observation(person("cam-a", now.plus_millis(10), 3.0)));

    let effects = reactor.tick_step(now.plus_millis(20), batch);
    let emitted: Vec<SystemEventKind> = effects
        .iter()
        .filter_map(|e| match e {
            SideEffect::Emit(event) => Some(event.kind),
            SideEffect::Publish(_) => None,
        })
        .collect();
    assert!(emitted.contains(&SystemEventKind::CameraQuarantined));
    assert!(emitted.contains(&SystemEventKind::CoverageGap));

    let model = &published(&effects)[0];
    assert!(model.tracks.is_empty());
    assert_eq!(model.camera_liveness("cam-a"), Some(Liveness::Quarantined));

    let released = reactor.tick_step(
        now.plus_millis(40),
        vec![Event::Acknowledge { camera_id: "cam-a".to_string() }],
    );
    assert_eq!(published(&released)[0].camera_liveness("cam-a"), Some(Liveness::Online));
}

#[test]
fn test_full_event_queue_drops_are_counted() {
    let (_tx, rx) = mpsc::channel(8);
    let (snap_tx, _snap_rx) = watch::channel(Arc::new(WorldModel::empty(zones())));
    let (events_tx, mut events_rx) = mpsc::channel(1);
    let mut engine = FusionEngine::new(FusionConfig::default(), zones());
    engine.register_camera("cam-a");
    let mut reactor = Reactor::new(rx, engine, snap_tx, events_tx);

    let now = Timestamp::from_millis(T0);
    let batch: Vec<Event> = (0..5)
        .map(|i| Event::Observation(Observation {
            class: "giraffe".to_string(),
            ..person("cam-a", now.plus_millis(i), 3.0)
        }))
        .collect();
    let effects = reactor.tick_step(now.plus_millis(10), batch);
    let emitted = effects.iter().filter(|e| matches!(e, SideEffect::Emit(_))).count();
    assert!(emitted >= 2, "quarantine raises several events");

    reactor.apply(effects);
    assert!(events_rx.try_recv().is_ok());
    assert_eq!(
        reactor.engine.telemetry().cycle_stats.dropped_system_events,
        (emitted - 1) as u64
    );
}

#[test]
fn test_losing_every_covering_camera_stops_robots_within_one_monitor_tick() {
    let (mut reactor, _tx, _rx) = reactor();
    let mut monitor = HealthMonitor::new(HealthConfig::default());
    let start = Timestamp::from_millis(T0);
    monitor.register("cam-a", start);

    let marker = Observation {
        robot_id: Some("ATR-23".to_string()),
        class: "robot".to_string(),
        extent: Extent::new(0.9, 0.7, 1.2),
        trust: 1.5,
        ..person("cam-a", start, 3.0)
    };
    monitor.observe(&HealthSignal::Frame {
        camera_id: "cam-a".to_string(),
        at: start,
    });
    let effects = reactor.tick_step(start, vec![Event::Observation(marker)]);

    let mut arbitrator = NavigationArbitrator::new(NavigationConfig::default());
    arbitrator.set_goal(RobotGoal::new("ATR-23", vec![Position::planar(3.0, 8.0)]));
    let before = arbitrator.evaluate_all(&published(&effects)[0]);
    assert_eq!(before.commands[0].directive, Directive::Proceed);

    // The only covering camera falls silent past the liveness window.
    let silent = start.plus_millis(HealthConfig::default().liveness_window_ms + 100);
    let status: Vec<Event> = monitor
        .tick(silent)
        .into_iter()
        .map(|change| Event::CameraStatus {
            camera_id: change.camera_id,
            liveness: change.to,
            at: change.at,
        })
        .collect();
    assert_eq!(status.len(), 1);

    let effects = reactor.tick_step(silent, status);
    assert!(effects
        .iter()
        .any(|e| matches!(e, SideEffect::Emit(event) if event.kind == SystemEventKind::CoverageGap)));
    let after = arbitrator.evaluate_all(&published(&effects)[0]);
    assert_eq!(after.commands[0].directive, Directive::Stop);
    assert_eq!(after.commands[0].reason, ReasonCode::CoverageGap);
    assert_eq!(after.commands[0].speed_cap, 0.0);
}

#[tokio::test]
async fn test_run_loop_publishes_and_returns_engine_on_cancel() {
    let (reactor, tx, mut snapshots) = reactor();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(reactor.run(Duration::from_millis(5), cancel.clone()));

    tx.send(Event::Observation(person("cam-a", Timestamp::now(), 2.0))).await.unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            snapshots.changed().await.unwrap();
            if !snapshots.borrow_and_update().tracks.is_empty() {
                break;
            }
        }
    })
    .await;
    assert!(seen.is_ok(), "track never appeared in a snapshot");

    cancel.cancel();
    let engine = handle.await.unwrap();
    assert_eq!(engine.tracks().count(), 1);
    assert!(engine.telemetry().cycle_stats.cycles >= 1);
}
