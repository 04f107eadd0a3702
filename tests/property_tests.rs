use std::collections::HashMap;

use proptest::prelude::*;

use aether_fusion::config::{FusionConfig, NavigationConfig};
use aether_fusion::kernel::event::{AccuracyClass, Observation};
use aether_fusion::kernel::geometry::{Extent, Polygon, Position};
use aether_fusion::kernel::time::Timestamp;
use aether_fusion::kernel::track::TrackId;
use aether_fusion::kernel::zone::{RiskCategory, Zone};
use aether_fusion::navigation::{Directive, NavigationArbitrator, RobotGoal};
use aether_fusion::FusionEngine;

const T0: u64 = 1_700_000_000_000;
const CAMERAS: [&str; 2] = ["cam-a", "cam-b"];

fn floor() -> Vec<Zone> {
    vec![Zone::new(
        "floor",
        Polygon::rectangle(0.0, 0.0, 10.0, 10.0),
        RiskCategory::Restricted,
        CAMERAS.iter().map(|c| c.to_string()).collect(),
    )]
}

fn engine() -> FusionEngine {
    let mut engine = FusionEngine::new(FusionConfig::default(), floor());
    for camera in CAMERAS {
        engine.register_camera(camera);
    }
    engine
}

fn observation(camera: &str, offset_ms: u64, x: f64, y: f64, label: &str) -> Observation {
    Observation {
        camera_id: camera.to_string(),
        timestamp: Timestamp::from_millis(T0 + offset_ms),
        position: Position::new(x, y, 0.9),
        extent: Extent::new(0.5, 0.5, 1.8),
        class: label.to_string(),
        confidence: 0.95,
        robot_id: None,
        task_id: None,
        pose: None,
        velocity: None,
        accuracy: AccuracyClass::High,
        trust: 1.0,
    }
}

proptest! {
    #[test]
    fn track_time_never_moves_backward(
        arrivals in prop::collection::vec((0usize..2, 0u64..800, -0.1f64..0.1), 1..40)
    ) {
        let mut engine = engine();
        let now = Timestamp::from_millis(T0 + 1_000);
        let mut seen: HashMap<TrackId, Timestamp> = HashMap::new();

        for (camera, offset, jitter) in arrivals {
            let _ = engine.ingest(observation(CAMERAS[camera], offset, 5.0 + jitter, 5.0, "person"), now);
            for track in engine.tracks() {
                if let Some(previous) = seen.get(&track.id) {
                    prop_assert!(track.last_update >= *previous);
                }
                seen.insert(track.id, track.last_update);
            }
        }
    }

    #[test]
    fn snapshots_are_monotonic_under_any_clock(
        offsets in prop::collection::vec(0u64..5_000, 1..30)
    ) {
        let mut engine = engine();
        let mut last: Option<(u64, Timestamp)> = None;

        for offset in offsets {
            let now = Timestamp::from_millis(T0 + offset);
            engine.end_cycle(now);
            let model = engine.snapshot(now);
            if let Some((generation, timestamp)) = last {
                prop_assert!(model.generation > generation);
                prop_assert!(model.timestamp >= timestamp);
            }
            last = Some((model.generation, model.timestamp));
        }
    }

    #[test]
    fn person_inside_inner_band_always_stops(
        gap in 0.5f64..2.5,
        lateral in -0.5f64..0.5,
        goal_x in 0.5f64..9.5,
    ) {
        let mut engine = engine();
        let now = Timestamp::from_millis(T0 + 50);
        let robot = Observation {
            robot_id: Some("ATR-23".to_string()),
            extent: Extent::new(0.9, 0.7, 1.2),
            trust: 1.5,
            ..observation("cam-a", 0, 2.0, 5.0, "robot")
        };
        engine.ingest(robot, now).unwrap();
        engine
            .ingest(observation("cam-b", 0, 2.25 + gap, 5.0 + lateral, "person"), now)
            .unwrap();
        engine.end_cycle(now);
        let model = engine.snapshot(now);

        let arbitrator = NavigationArbitrator::new(NavigationConfig::default());
        let goal = RobotGoal::new("ATR-23", vec![Position::planar(goal_x, 2.0)]);
        let command = arbitrator.evaluate(&model, &goal);
        prop_assert!(command.is_some());
        if let Some(command) = command {
            prop_assert_eq!(command.directive, Directive::Stop);
            prop_assert_eq!(command.speed_cap, 0.0);
        }
    }
}
