use std::f64::consts::PI;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use aether_fusion::adapter::{AdapterLinks, DetectionAdapter, LocalBox, RawDetection, RawFrame};
use aether_fusion::calibration::{CalibrationHandle, CalibrationRecord, Extrinsics, Intrinsics};
use aether_fusion::config::AdapterConfig;
use aether_fusion::error::CalibrationError;
use aether_fusion::kernel::event::{AccuracyClass, Event, SystemEventKind};
use aether_fusion::kernel::geometry::Orientation;
use aether_fusion::kernel::time::Timestamp;
use aether_fusion::monitor::HealthSignal;

const T0: u64 = 1_700_000_000_000;

fn at(offset_ms: u64) -> Timestamp {
    Timestamp::from_millis(T0 + offset_ms)
}

fn overhead(valid_until: Option<Timestamp>) -> CalibrationRecord {
    CalibrationRecord {
        camera_id: "cam-a".to_string(),
        intrinsics: Intrinsics::pinhole(500.0, 500.0, 320.0, 240.0),
        extrinsics: Extrinsics {
            roll: PI,
            x: 5.0,
            y: 5.0,
            z: 3.0,
            ..Extrinsics::default()
        },
        valid_from: at(0),
        valid_until,
        accuracy_m: 0.1,
    }
}

fn adapter() -> DetectionAdapter {
    DetectionAdapter::new(CalibrationHandle::fixed(overhead(None)), AdapterConfig::default())
}

fn person_box(confidence: f32) -> RawDetection {
    RawDetection::Classified {
        class: "person".to_string(),
        bbox: LocalBox::Pixel {
            u_min: 295.0,
            v_min: 200.0,
            u_max: 345.0,
            v_max: 240.0,
        },
        confidence,
    }
}

fn marker() -> RawDetection {
    RawDetection::Marker {
        robot_id: "ATR-23".to_string(),
        task_id: Some("T-9".to_string()),
        position: [0.0, 0.0, 3.0],
        orientation: Orientation::default(),
        confidence: 0.95,
        extent: None,
    }
}

fn frame(offset_ms: u64, detections: Vec<RawDetection>) -> RawFrame {
    RawFrame {
        camera_id: "cam-a".to_string(),
        timestamp: at(offset_ms),
        detections,
    }
}

#[test]
fn test_pixel_box_lands_on_the_floor_contact_point() {
    let mut adapter = adapter();
    let observations = adapter.normalize(&frame(10, vec![person_box(0.8)])).unwrap();
    assert_eq!(observations.len(), 1);

    let obs = &observations[0];
    assert_eq!(obs.class, "person");
    assert_eq!(obs.camera_id, "cam-a");
    assert_eq!(obs.timestamp, at(10));
    assert_eq!(obs.accuracy, AccuracyClass::Medium);
    assert!((obs.position.x - 5.0).abs() < 1e-9);
    assert!((obs.position.y - 5.0).abs() < 1e-9);
    assert!((obs.extent.width - 0.3).abs() < 1e-9, "width {}", obs.extent.width);
    assert!((obs.extent.height - 0.24).abs() < 1e-9, "height {}", obs.extent.height);
    assert!((obs.position.z - 0.12).abs() < 1e-9);
    assert!(obs.robot_id.is_none());
}

#[test]
fn test_marker_carries_identity_and_footprint() {
    let mut adapter = adapter();
    let observations = adapter.normalize(&frame(10, vec![marker()])).unwrap();
    let obs = &observations[0];

    assert_eq!(obs.class, "robot");
    assert_eq!(obs.robot_id.as_deref(), Some("ATR-23"));
    assert_eq!(obs.task_id.as_deref(), Some("T-9"));
    assert!((obs.position.x - 5.0).abs() < 1e-9 && (obs.position.y - 5.0).abs() < 1e-9);
    assert!(obs.position.z.abs() < 1e-9);
    assert_eq!(obs.extent, AdapterConfig::default().robot_footprint);
    assert!((obs.trust - 1.5).abs() < 1e-6);
    assert!(obs.pose.is_some());
}

#[test]
fn test_low_confidence_and_foreign_frames_are_dropped() {
    let mut adapter = adapter();
    let kept = adapter
        .normalize(&frame(10, vec![person_box(0.1), person_box(0.9)]))
        .unwrap();
    assert_eq!(kept.len(), 1);

    let foreign = RawFrame {
        camera_id: "cam-b".to_string(),
        ..frame(20, vec![person_box(0.9)])
    };
    assert!(adapter.normalize(&foreign).unwrap().is_empty());

    let stats = adapter.stats();
    assert_eq!(stats.frames, 2);
    assert_eq!(stats.below_floor, 1);
    assert_eq!(stats.emitted, 1);
    assert_eq!(stats.foreign, 1);
}

#[test]
fn test_inverted_pixel_box_is_unprojectable() {
    let mut adapter = adapter();
    let inverted = RawDetection::Classified {
        class: "pallet".to_string(),
        bbox: LocalBox::Pixel {
            u_min: 345.0,
            v_min: 240.0,
            u_max: 295.0,
            v_max: 200.0,
        },
        confidence: 0.9,
    };
    assert!(adapter.normalize(&frame(10, vec![inverted])).unwrap().is_empty());
    assert_eq!(adapter.stats().unprojectable, 1);
}

#[test]
fn test_expired_calibration_rejects_frames_and_reports_once() {
    let handle = CalibrationHandle::fixed(overhead(Some(at(1_000))));
    let mut adapter = DetectionAdapter::new(handle, AdapterConfig::default());

    assert_eq!(adapter.normalize(&frame(500, vec![person_box(0.9)])).unwrap().len(), 1);
    assert!(adapter.take_events().is_empty());

    for offset in [1_000, 1_100, 1_200] {
        assert!(matches!(
            adapter.normalize(&frame(offset, vec![person_box(0.9)])),
            Err(CalibrationError::Expired { .. })
        ));
    }
    let events = adapter.take_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, SystemEventKind::CalibrationExpired);
    assert_eq!(adapter.stats().uncalibrated, 3);
}

#[test]
fn test_observation_stream_skips_rejected_frames() {
    let handle = CalibrationHandle::fixed(overhead(Some(at(1_000))));
    let mut adapter = DetectionAdapter::new(handle, AdapterConfig::default());
    let frames = vec![
        frame(100, vec![person_box(0.9), marker()]),
        frame(2_000, vec![person_box(0.9)]),
        frame(300, vec![marker()]),
    ];
    let classes: Vec<String> = adapter.observations(frames).map(|o| o.class).collect();
    assert_eq!(classes, vec!["person", "robot", "robot"]);
}

#[tokio::test]
async fn test_adapter_task_heartbeats_and_forwards() {
    let (frames_tx, frames_rx) = mpsc::channel(8);
    let (mailbox_tx, mut mailbox_rx) = mpsc::channel(8);
    let (health_tx, mut health_rx) = mpsc::channel(8);
    let (events_tx, _events_rx) = mpsc::channel(8);
    let (tap_tx, mut tap_rx) = mpsc::channel(8);
    let links = AdapterLinks {
        mailbox: mailbox_tx,
        health: health_tx,
        events: events_tx,
        tap: Some(tap_tx),
    };
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(adapter().run(frames_rx, links, cancel.clone()));

    frames_tx.send(frame(10, vec![person_box(0.9)])).await.unwrap();
    frames_tx.send(frame(20, vec![])).await.unwrap();

    let forwarded = tokio::time::timeout(Duration::from_secs(2), mailbox_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(forwarded, Event::Observation(ref o) if o.class == "person"));
    assert_eq!(tap_rx.recv().await.unwrap().class, "person");

    // The empty frame still counts as proof of life.
    for _ in 0..2 {
        let signal = health_rx.recv().await.unwrap();
        assert!(matches!(signal, HealthSignal::Frame { ref camera_id, .. } if camera_id == "cam-a"));
    }

    drop(frames_tx);
    let stats = handle.await.unwrap();
    assert_eq!(stats.frames, 2);
    assert_eq!(stats.emitted, 1);
    assert!(matches!(health_rx.recv().await, Some(HealthSignal::Disconnected { .. })));
}
