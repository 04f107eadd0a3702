use std::path::PathBuf;

use aether_fusion::config::{load_zones, SystemConfig};
use aether_fusion::error::ConfigError;
use aether_fusion::kernel::event::EntityClass;
use aether_fusion::kernel::zone::RiskCategory;

fn scratch(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("aether-config-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

const BAY: &str = r#"{
    "id": "bay",
    "polygon": { "vertices": [ {"x": 0, "y": 0}, {"x": 10, "y": 0}, {"x": 10, "y": 10}, {"x": 0, "y": 10} ] },
    "risk": "caution",
    "cameras": ["cam-a"]
}"#;

#[test]
fn test_partial_config_falls_back_to_defaults() {
    let path = scratch(
        "node.json",
        &format!(
            r#"{{ "node_id": "line-3", "cameras": [{{"id": "cam-a"}}], "zones": [{}],
                 "fusion": {{ "gate_distance_m": 0.8 }}, "publisher": {{ "mirror_observations": true }} }}"#,
            BAY
        ),
    );
    let config = SystemConfig::load(&path).unwrap();

    assert_eq!(config.node_id, "line-3");
    assert_eq!(config.enabled_cameras().count(), 1);
    assert_eq!(config.zones[0].risk, RiskCategory::Caution);
    assert!((config.zones[0].effective_policy().max_speed - 1.2).abs() < 1e-9);
    assert!((config.fusion.gate_distance_m - 0.8).abs() < 1e-9);
    assert_eq!(config.fusion.coast_after_ms, 300);
    assert_eq!(config.fusion.class_of(" Person "), Some(EntityClass::Person));
    assert!(config.publisher.mirror_observations);
    assert_eq!(config.health.liveness_window_ms, 1_500);
}

#[test]
fn test_node_without_zones_refuses_to_start() {
    let path = scratch("empty.json", r#"{ "cameras": [{"id": "cam-a"}] }"#);
    assert!(matches!(SystemConfig::load(&path), Err(ConfigError::NoZones)));
}

#[test]
fn test_zone_feed_is_read_when_config_has_none() {
    let zones = scratch("zones.json", &format!("[{}]", BAY));
    let node = scratch(
        "node.json",
        &format!(r#"{{ "zones_path": {} }}"#, serde_json::to_string(&zones).unwrap()),
    );
    let config = SystemConfig::load(&node).unwrap();
    assert_eq!(config.zones.len(), 1);
    assert_eq!(config.zones[0].id, "bay");
}

#[test]
fn test_invalid_zone_feeds_are_rejected() {
    let duplicate = scratch("dup.json", &format!("[{}, {}]", BAY, BAY));
    assert!(matches!(load_zones(&duplicate), Err(ConfigError::Invalid(_))));

    let degenerate = scratch(
        "flat.json",
        r#"[{ "id": "line", "polygon": { "vertices": [ {"x": 0, "y": 0}, {"x": 5, "y": 0}, {"x": 10, "y": 0} ] }, "risk": "free" }]"#,
    );
    assert!(matches!(load_zones(&degenerate), Err(ConfigError::Invalid(_))));

    let garbage = scratch("bad.json", "not json");
    assert!(matches!(load_zones(&garbage), Err(ConfigError::Parse(_))));

    let missing = std::env::temp_dir().join("aether-config-does-not-exist.json");
    assert!(matches!(load_zones(&missing), Err(ConfigError::Io { .. })));
}

#[test]
fn test_inconsistent_thresholds_fail_validation() {
    let path = scratch(
        "node.json",
        &format!(
            r#"{{ "zones": [{}], "navigation": {{ "thresholds": {{ "person": {{ "inner": 4.0, "outer": 2.0 }} }} }} }}"#,
            BAY
        ),
    );
    assert!(matches!(SystemConfig::load(&path), Err(ConfigError::Invalid(_))));
}
