use std::f64::consts::PI;

use nalgebra::Point3;

use aether_fusion::calibration::{
    CalibrationRecord, CalibrationResolver, CalibrationStore, DirectoryCalibrationStore, Extrinsics, Intrinsics,
    MemoryCalibrationStore,
};
use aether_fusion::error::CalibrationError;
use aether_fusion::kernel::event::{AccuracyClass, SystemEventKind};
use aether_fusion::kernel::time::Timestamp;

const T0: u64 = 1_700_000_000_000;

fn at(offset_ms: u64) -> Timestamp {
    Timestamp::from_millis(T0 + offset_ms)
}

/// Ceiling camera 3 m up at (5, 5), looking straight down.
fn overhead(camera_id: &str) -> CalibrationRecord {
    CalibrationRecord {
        camera_id: camera_id.to_string(),
        intrinsics: Intrinsics::pinhole(500.0, 500.0, 320.0, 240.0),
        extrinsics: Extrinsics {
            roll: PI,
            pitch: 0.0,
            yaw: 0.0,
            x: 5.0,
            y: 5.0,
            z: 3.0,
        },
        valid_from: at(0),
        valid_until: Some(at(60_000)),
        accuracy_m: 0.04,
    }
}

#[test]
fn test_overhead_camera_projects_onto_floor() {
    let record = overhead("cam-a");
    assert!(record.validate(at(10)).is_ok());
    assert_eq!(record.accuracy_class(), AccuracyClass::High);

    let centre = record.pixel_to_floor(320.0, 240.0).unwrap();
    assert!((centre.x - 5.0).abs() < 1e-9 && (centre.y - 5.0).abs() < 1e-9);
    assert!(centre.z.abs() < 1e-12);

    let right = record.pixel_to_floor(570.0, 240.0).unwrap();
    assert!((right.x - 6.5).abs() < 1e-9, "x = {}", right.x);

    // Image "down" maps to factory -y for a camera flipped about its x axis.
    let lower = record.pixel_to_floor(320.0, 490.0).unwrap();
    assert!((lower.y - 3.5).abs() < 1e-9, "y = {}", lower.y);

    let below = record.to_world(&Point3::new(0.0, 0.0, 3.0));
    assert!((below.x - 5.0).abs() < 1e-9 && (below.y - 5.0).abs() < 1e-9 && below.z.abs() < 1e-9);
    assert!((record.range_to(&below) - 3.0).abs() < 1e-9);
}

#[test]
fn test_camera_facing_the_ceiling_never_hits_the_floor() {
    let mut record = overhead("cam-up");
    record.extrinsics.roll = 0.0;
    assert!(record.pixel_to_floor(320.0, 240.0).is_none());
}

#[test]
fn test_degenerate_and_expired_records_are_rejected() {
    let mut flat = overhead("cam-a");
    flat.intrinsics.fx = 0.0;
    assert!(matches!(flat.validate(at(10)), Err(CalibrationError::Degenerate { .. })));

    let mut vague = overhead("cam-a");
    vague.accuracy_m = f64::NAN;
    assert!(matches!(vague.validate(at(10)), Err(CalibrationError::Degenerate { .. })));

    let record = overhead("cam-a");
    assert!(matches!(record.validate(at(60_000)), Err(CalibrationError::Expired { .. })));

    let mut future = overhead("cam-a");
    future.valid_from = at(5_000);
    assert!(matches!(future.check_validity(at(10)), Err(CalibrationError::NotYetValid { .. })));
}

#[test]
fn test_handles_follow_updates_and_expiry() {
    let mut resolver = CalibrationResolver::new();
    let handle = resolver.watch("cam-a");
    assert!(matches!(handle.current(at(10)), Err(CalibrationError::NotCalibrated { .. })));

    assert_eq!(resolver.update(overhead("cam-a"), at(10)).unwrap(), None);
    let seen = handle.current(at(20)).unwrap();
    assert_eq!(seen.camera_id, "cam-a");
    assert!(resolver.resolve("cam-a", at(20)).is_ok());

    let expired = resolver.sweep(at(60_000));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].kind, SystemEventKind::CalibrationExpired);
    assert!(handle.current(at(60_001)).is_err());
    assert!(resolver.sweep(at(60_100)).is_empty(), "expiry is reported once");

    let mut renewed = overhead("cam-a");
    renewed.valid_until = Some(at(120_000));
    let restored = resolver.update(renewed, at(60_200)).unwrap();
    assert_eq!(restored.map(|e| e.kind), Some(SystemEventKind::CalibrationRestored));
    assert!(handle.current(at(60_300)).is_ok());
}

#[test]
fn test_store_loads_and_reports_rejections_once() {
    let store = MemoryCalibrationStore::new();
    store.insert(&overhead("cam-a")).unwrap();
    store.insert_raw("cam-b", "{ not json").unwrap();

    let mut resolver = CalibrationResolver::new();
    let cameras = vec!["cam-a".to_string(), "cam-b".to_string(), "cam-c".to_string()];
    let events = resolver.refresh(&store, &cameras, at(10));

    // cam-b is undecodable; cam-c simply has no record yet and is left to its adapter.
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, SystemEventKind::CalibrationRejected);
    assert_eq!(events[0].source, "cam-b");
    assert!(resolver.resolve("cam-a", at(10)).is_ok());

    assert!(resolver.refresh(&store, &cameras, at(20)).is_empty());

    store.insert(&overhead("cam-b")).unwrap();
    let fixed = resolver.refresh(&store, &cameras, at(30));
    assert_eq!(fixed.len(), 1);
    assert_eq!(fixed[0].kind, SystemEventKind::CalibrationRestored);
}

#[test]
fn test_store_document_for_another_camera_is_rejected() {
    let store = MemoryCalibrationStore::new();
    let raw = serde_json::to_string(&overhead("cam-b")).unwrap();
    store.insert_raw("cam-a", raw).unwrap();

    let mut resolver = CalibrationResolver::new();
    assert!(matches!(
        resolver.load(&store, "cam-a", at(10)),
        Err(CalibrationError::Decode { .. })
    ));
}

#[test]
fn test_directory_store_reads_one_document_per_camera() {
    let dir = std::env::temp_dir().join(format!("aether-calib-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("cam-a.json"), serde_json::to_string(&overhead("cam-a")).unwrap()).unwrap();

    let store = DirectoryCalibrationStore::new(&dir);
    assert!(store.get("cam-a").unwrap().is_some());
    assert!(store.get("cam-missing").unwrap().is_none());
    assert!(matches!(store.get("../etc/passwd"), Err(CalibrationError::Store(_))));

    let mut resolver = CalibrationResolver::new();
    assert!(resolver.load(&store, "cam-a", at(10)).is_ok());

    std::fs::remove_dir_all(&dir).unwrap();
}
