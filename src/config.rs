//! Node configuration.
//!
//! Every section is `#[serde(default)]`, so a config file only needs to name
//! what differs from the defaults. Zones have no default: a node without zones
//! refuses to start.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::kernel::event::{CameraId, EntityClass};
use crate::kernel::geometry::Extent;
use crate::kernel::track::TrackKind;
use crate::kernel::zone::{SpeedPolicy, Zone};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub node_id: String,
    pub cameras: Vec<CameraConfig>,
    pub zones: Vec<Zone>,
    /// Optional zone feed; re-read on reload requests.
    pub zones_path: Option<PathBuf>,
    pub calibration: CalibrationConfig,
    pub adapter: AdapterConfig,
    pub fusion: FusionConfig,
    pub health: HealthConfig,
    pub navigation: NavigationConfig,
    pub publisher: PublisherConfig,
    pub logging: LoggingConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            node_id: "fusion-node-1".to_string(),
            cameras: Vec::new(),
            zones: Vec::new(),
            zones_path: None,
            calibration: CalibrationConfig::default(),
            adapter: AdapterConfig::default(),
            fusion: FusionConfig::default(),
            health: HealthConfig::default(),
            navigation: NavigationConfig::default(),
            publisher: PublisherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: SystemConfig = serde_json::from_str(&raw)?;
        if config.zones.is_empty() {
            if let Some(zones_path) = config.zones_path.clone() {
                config.zones = load_zones(&zones_path)?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zones.is_empty() {
            return Err(ConfigError::NoZones);
        }
        validate_zones(&self.zones)?;

        let mut ids = HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(ConfigError::Invalid("camera with empty id".to_string()));
            }
            if !ids.insert(camera.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate camera id '{}'", camera.id)));
            }
        }

        self.adapter.validate()?;
        self.fusion.validate()?;
        self.navigation.validate()?;

        if self.health.liveness_window_ms == 0 || self.health.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("health intervals must be positive".to_string()));
        }
        if !(self.publisher.snapshot_rate_hz > 0.0) {
            return Err(ConfigError::Invalid("snapshot_rate_hz must be positive".to_string()));
        }
        if self.publisher.max_attempts == 0 {
            return Err(ConfigError::Invalid("publisher.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.iter().filter(|c| c.enabled)
    }
}

/// Read a zone feed file (a JSON array of zones) and validate it.
pub fn load_zones(path: &Path) -> Result<Vec<Zone>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let zones: Vec<Zone> = serde_json::from_str(&raw)?;
    if zones.is_empty() {
        return Err(ConfigError::NoZones);
    }
    validate_zones(&zones)?;
    Ok(zones)
}

pub fn validate_zones(zones: &[Zone]) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    for zone in zones {
        if !ids.insert(zone.id.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate zone id '{}'", zone.id)));
        }
        if !zone.polygon.is_valid() {
            return Err(ConfigError::Invalid(format!("zone '{}' has a degenerate polygon", zone.id)));
        }
        let policy = zone.effective_policy();
        if !(policy.max_speed >= 0.0) || !(policy.proximity_scale > 0.0) {
            return Err(ConfigError::Invalid(format!("zone '{}' has an invalid speed policy", zone.id)));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub id: CameraId,
    pub name: String,
    pub enabled: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            id: "camera-1".to_string(),
            name: "Camera 1".to_string(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Directory holding `<camera_id>.json` calibration records.
    pub store_dir: Option<PathBuf>,
    pub refresh_interval_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            refresh_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Detections below this confidence never leave the adapter.
    pub confidence_floor: f32,
    pub marker_trust: f32,
    pub appearance_trust: f32,
    /// Raw-frame queue depth per camera.
    pub frame_queue: usize,
    /// Footprint assumed for marker detections that carry no extent.
    pub robot_footprint: Extent,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.3,
            marker_trust: 1.5,
            appearance_trust: 1.0,
            frame_queue: 64,
            robot_footprint: Extent::new(0.9, 0.7, 1.2),
        }
    }
}

impl AdapterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(ConfigError::Invalid("adapter.confidence_floor must be in [0,1]".to_string()));
        }
        if !(self.marker_trust > 0.0) || !(self.appearance_trust > 0.0) {
            return Err(ConfigError::Invalid("adapter trust weights must be positive".to_string()));
        }
        if self.frame_queue == 0 {
            return Err(ConfigError::Invalid("adapter.frame_queue must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorldBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: f64,
    pub max_z: f64,
}

impl Default for WorldBounds {
    fn default() -> Self {
        Self {
            min_x: -500.0,
            max_x: 500.0,
            min_y: -500.0,
            max_y: 500.0,
            min_z: -5.0,
            max_z: 20.0,
        }
    }
}

/// Gating, association, voting and lifecycle parameters of the fusion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub cycle_interval_ms: u64,
    pub mailbox_capacity: usize,
    pub world_bounds: WorldBounds,
    /// Raw label (lowercase) -> fused class. Labels not listed are malformed.
    pub class_map: BTreeMap<String, EntityClass>,

    // Gating
    pub gate_distance_m: f64,
    pub gate_uncertainty_gain: f64,
    pub max_staleness_ms: u64,
    pub max_observation_age_ms: u64,
    pub future_tolerance_ms: u64,

    // Association scoring
    pub w_distance: f64,
    pub w_confidence: f64,
    pub w_class: f64,
    pub ambiguity_margin: f64,
    /// Minimum spacing of SystemEvents reporting the same input error for one camera.
    pub error_event_interval_ms: u64,

    // Fusion update
    pub max_prior_weight: f64,
    pub velocity_min_dt_ms: u64,
    pub velocity_smoothing: f64,
    pub stationary_speed: f64,
    pub vote_window_ms: u64,
    pub high_confidence_vote: f32,

    // Lifecycle
    pub confirmation_window_ms: u64,
    pub coast_after_ms: u64,
    pub coast_grace_ms: u64,
    pub coast_confidence_decay_per_s: f32,
    pub coast_sigma_growth_m_per_s: f64,
    pub contributor_window_ms: u64,

    // Conflict resolution
    pub merge_distance_m: f64,

    // Quarantine
    pub quarantine_threshold: u32,
    pub quarantine_window_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        let class_map = [
            ("person", EntityClass::Person),
            ("human", EntityClass::Person),
            ("robot", EntityClass::Robot),
            ("agv", EntityClass::Robot),
            ("amr", EntityClass::Robot),
            ("forklift", EntityClass::Robot),
            ("pallet", EntityClass::Obstacle),
            ("obstacle", EntityClass::Obstacle),
            ("unknown", EntityClass::Unknown),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            cycle_interval_ms: 33,
            mailbox_capacity: 1024,
            world_bounds: WorldBounds::default(),
            class_map,
            gate_distance_m: 0.5,
            gate_uncertainty_gain: 1.0,
            max_staleness_ms: 1_000,
            max_observation_age_ms: 2_000,
            future_tolerance_ms: 500,
            w_distance: 1.0,
            w_confidence: 0.3,
            w_class: 0.5,
            ambiguity_margin: 0.05,
            error_event_interval_ms: 5_000,
            max_prior_weight: 5.0,
            velocity_min_dt_ms: 200,
            velocity_smoothing: 0.5,
            stationary_speed: 0.05,
            vote_window_ms: 2_000,
            high_confidence_vote: 0.7,
            confirmation_window_ms: 1_000,
            coast_after_ms: 300,
            coast_grace_ms: 2_000,
            coast_confidence_decay_per_s: 0.2,
            coast_sigma_growth_m_per_s: 0.5,
            contributor_window_ms: 2_000,
            merge_distance_m: 0.3,
            quarantine_threshold: 5,
            quarantine_window_ms: 10_000,
        }
    }
}

impl FusionConfig {
    pub fn class_of(&self, label: &str) -> Option<EntityClass> {
        self.class_map.get(&label.trim().to_ascii_lowercase()).copied()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_interval_ms == 0 || self.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid("fusion cycle interval and mailbox must be positive".to_string()));
        }
        if !(self.gate_distance_m > 0.0) || !(self.gate_uncertainty_gain >= 0.0) {
            return Err(ConfigError::Invalid("fusion gate must be positive".to_string()));
        }
        if self.class_map.is_empty() {
            return Err(ConfigError::Invalid("fusion.class_map is empty".to_string()));
        }
        if !(self.max_prior_weight > 0.0) {
            return Err(ConfigError::Invalid("fusion.max_prior_weight must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.velocity_smoothing) {
            return Err(ConfigError::Invalid("fusion.velocity_smoothing must be in [0,1]".to_string()));
        }
        if self.coast_grace_ms < self.coast_after_ms {
            return Err(ConfigError::Invalid("fusion.coast_grace_ms must not be shorter than coast_after_ms".to_string()));
        }
        if self.quarantine_threshold == 0 {
            return Err(ConfigError::Invalid("fusion.quarantine_threshold must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub liveness_window_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            liveness_window_ms: 1_500,
            tick_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Threshold {
    pub inner: f64,
    pub outer: f64,
}

/// Base proximity thresholds per intruder class, before zone scaling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityThresholds {
    pub person: Threshold,
    pub robot: Threshold,
    /// Static obstacles; a moving obstacle uses `moving_obstacle`.
    pub obstacle: Threshold,
    pub moving_obstacle: Threshold,
    pub unknown: Threshold,
}

impl Default for ProximityThresholds {
    fn default() -> Self {
        Self {
            person: Threshold { inner: 2.0, outer: 4.0 },
            robot: Threshold { inner: 1.0, outer: 2.5 },
            obstacle: Threshold { inner: 0.5, outer: 1.2 },
            moving_obstacle: Threshold { inner: 1.0, outer: 2.0 },
            unknown: Threshold { inner: 1.5, outer: 3.0 },
        }
    }
}

impl ProximityThresholds {
    pub fn for_kind(&self, kind: &TrackKind) -> Threshold {
        match kind {
            TrackKind::Person => self.person,
            TrackKind::Robot { .. } => self.robot,
            TrackKind::Obstacle { stationary: true } => self.obstacle,
            TrackKind::Obstacle { stationary: false } => self.moving_obstacle,
            TrackKind::Unknown => self.unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    pub tick_interval_ms: u64,
    pub thresholds: ProximityThresholds,
    /// Person tracks below this confidence are treated as present-until-resolved.
    pub person_confidence_floor: f32,
    pub lookahead_m: f64,
    pub path_sample_step_m: f64,
    pub min_creep_speed: f64,
    pub reduced_coverage_factor: f64,
    pub override_speed_cap: f64,
    /// Policy applied on floor area outside every configured zone.
    pub default_policy: SpeedPolicy,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            thresholds: ProximityThresholds::default(),
            person_confidence_floor: 0.5,
            lookahead_m: 5.0,
            path_sample_step_m: 0.25,
            min_creep_speed: 0.1,
            reduced_coverage_factor: 0.5,
            override_speed_cap: 0.3,
            default_policy: SpeedPolicy { max_speed: 1.0, proximity_scale: 1.2 },
        }
    }
}

impl NavigationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, t) in [
            ("person", self.thresholds.person),
            ("robot", self.thresholds.robot),
            ("obstacle", self.thresholds.obstacle),
            ("moving_obstacle", self.thresholds.moving_obstacle),
            ("unknown", self.thresholds.unknown),
        ] {
            if !(t.inner > 0.0) || !(t.outer > t.inner) {
                return Err(ConfigError::Invalid(format!(
                    "navigation.thresholds.{}: need 0 < inner < outer",
                    name
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.person_confidence_floor) {
            return Err(ConfigError::Invalid("navigation.person_confidence_floor must be in [0,1]".to_string()));
        }
        if !(self.lookahead_m >= 0.0) || !(self.path_sample_step_m > 0.0) {
            return Err(ConfigError::Invalid("navigation lookahead/sample step invalid".to_string()));
        }
        if !(0.0..=1.0).contains(&self.reduced_coverage_factor) {
            return Err(ConfigError::Invalid("navigation.reduced_coverage_factor must be in [0,1]".to_string()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("navigation.tick_interval_ms must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub snapshot_rate_hz: f64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive failed publications before the publisher halts.
    pub fatal_after_failures: u32,
    pub event_queue: usize,
    /// Also put every normalized observation on the bus.
    pub mirror_observations: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            snapshot_rate_hz: 10.0,
            max_attempts: 3,
            backoff_base_ms: 20,
            backoff_max_ms: 500,
            fatal_after_failures: 5,
            event_queue: 256,
            mirror_observations: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: false,
        }
    }
}
