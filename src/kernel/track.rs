use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::event::{CameraId, EntityClass, Observation, RobotId, TaskId};
use super::geometry::{BoundingVolume, Orientation, Position, Velocity};
use super::time::Timestamp;
use crate::config::FusionConfig;

pub type TrackId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotIdentity {
    pub robot_id: RobotId,
    pub task_id: Option<TaskId>,
}

/// What a track represents. Robot identity only ever comes from a marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackKind {
    Robot { identity: Option<RobotIdentity> },
    Person,
    /// Stationary until fused velocity says otherwise.
    Obstacle { stationary: bool },
    Unknown,
}

impl TrackKind {
    pub fn from_class(class: EntityClass) -> Self {
        match class {
            EntityClass::Robot => TrackKind::Robot { identity: None },
            EntityClass::Person => TrackKind::Person,
            EntityClass::Obstacle => TrackKind::Obstacle { stationary: true },
            EntityClass::Unknown => TrackKind::Unknown,
        }
    }

    pub fn class(&self) -> EntityClass {
        match self {
            TrackKind::Robot { .. } => EntityClass::Robot,
            TrackKind::Person => EntityClass::Person,
            TrackKind::Obstacle { .. } => EntityClass::Obstacle,
            TrackKind::Unknown => EntityClass::Unknown,
        }
    }

    pub fn identity(&self) -> Option<&RobotIdentity> {
        match self {
            TrackKind::Robot { identity } => identity.as_ref(),
            _ => None,
        }
    }

    pub fn robot_id(&self) -> Option<&RobotId> {
        self.identity().map(|i| &i.robot_id)
    }

    pub fn is_marker_locked(&self) -> bool {
        self.identity().is_some()
    }

    /// Re-label an unidentified track, keeping variant data when the class is unchanged.
    fn relabel(&self, class: EntityClass) -> TrackKind {
        if self.class() == class {
            self.clone()
        } else {
            TrackKind::from_class(class)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Tentative,
    Confirmed,
    Coasting,
    Lost,
}

#[derive(Debug, Clone, PartialEq)]
struct ClassVote {
    class: EntityClass,
    weight: f64,
    confidence: f32,
    timestamp: Timestamp,
}

/// A fused, persistent identity for one physical entity.
///
/// Owned by the fusion engine; only its association and lifecycle steps mutate it.
/// Snapshots carry clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    #[serde(flatten)]
    pub kind: TrackKind,
    pub volume: BoundingVolume,
    pub orientation: Option<Orientation>,
    pub velocity: Velocity,
    pub confidence: f32,
    /// Contributing cameras with their latest contribution time.
    pub contributors: BTreeMap<CameraId, Timestamp>,
    pub first_seen: Timestamp,
    pub last_update: Timestamp,
    pub state: TrackState,
    pub hits: u32,
    pub misses: u32,
    /// One-sigma planar uncertainty at `last_update` (metres).
    pub sigma_m: f64,

    #[serde(skip)]
    fused_center: Position,
    #[serde(skip)]
    fused_confidence: f32,
    #[serde(skip)]
    weight: f64,
    #[serde(skip)]
    votes: VecDeque<ClassVote>,
    #[serde(skip)]
    velocity_anchor: Option<(Position, Timestamp)>,
    #[serde(skip)]
    pub(crate) matched_this_cycle: bool,
}

impl Track {
    /// Spawn a Tentative track from an unmatched observation.
    pub fn spawn(id: TrackId, obs: &Observation, class: EntityClass) -> Self {
        let kind = match &obs.robot_id {
            Some(robot_id) => TrackKind::Robot {
                identity: Some(RobotIdentity {
                    robot_id: robot_id.clone(),
                    task_id: obs.task_id.clone(),
                }),
            },
            None => TrackKind::from_class(class),
        };
        let mut contributors = BTreeMap::new();
        contributors.insert(obs.camera_id.clone(), obs.timestamp);
        let mut votes = VecDeque::new();
        votes.push_back(ClassVote {
            class: if obs.is_marker() { EntityClass::Robot } else { class },
            weight: obs.weight(),
            confidence: obs.confidence,
            timestamp: obs.timestamp,
        });

        Self {
            id,
            kind,
            volume: BoundingVolume::new(obs.position, obs.extent),
            orientation: obs.pose.map(|p| p.orientation),
            velocity: obs.velocity.unwrap_or_default(),
            confidence: obs.confidence,
            contributors,
            first_seen: obs.timestamp,
            last_update: obs.timestamp,
            state: TrackState::Tentative,
            hits: 1,
            misses: 0,
            sigma_m: obs.accuracy.sigma_m(),
            fused_center: obs.position,
            fused_confidence: obs.confidence,
            weight: obs.weight().max(1e-3),
            votes,
            velocity_anchor: Some((obs.position, obs.timestamp)),
            matched_this_cycle: true,
        }
    }

    pub fn class(&self) -> EntityClass {
        self.kind.class()
    }

    pub fn cameras(&self) -> impl Iterator<Item = &CameraId> {
        self.contributors.keys()
    }

    pub fn is_sole_camera(&self, camera_id: &str) -> bool {
        self.contributors.len() == 1 && self.contributors.contains_key(camera_id)
    }

    pub fn is_live(&self) -> bool {
        self.state != TrackState::Lost
    }

    /// Fused position propagated by the current velocity estimate.
    pub fn predicted_position(&self, at: Timestamp) -> Position {
        let dt = at.secs_since(self.last_update).max(0.0);
        self.fused_center.advanced(&self.velocity, dt)
    }

    pub fn uncertainty_at(&self, at: Timestamp, growth_per_s: f64) -> f64 {
        let dt = at.secs_since(self.last_update).max(0.0);
        self.sigma_m + growth_per_s * dt
    }

    /// Recursive confidence-weighted update with a matched observation.
    /// Returns the lifecycle transition, if any.
    pub fn absorb(
        &mut self,
        obs: &Observation,
        class: EntityClass,
        cfg: &FusionConfig,
    ) -> Option<(TrackState, TrackState)> {
        let at = obs.timestamp;
        let prior_center = self.predicted_position(at);
        let prior_sigma = self.uncertainty_at(at, cfg.coast_sigma_growth_m_per_s);
        let w_prior = self.weight.min(cfg.max_prior_weight);
        let w_obs = obs.weight().max(1e-3);

        // === 1. STATE BLEND ===
        let center = prior_center.blend(w_prior, &obs.position, w_obs);
        self.fused_center = center;
        self.volume = BoundingVolume::new(center, self.volume.extent.blend(w_prior, &obs.extent, w_obs));
        self.fused_confidence = ((f64::from(self.fused_confidence) * w_prior + f64::from(obs.confidence) * w_obs)
            / (w_prior + w_obs)) as f32;
        self.confidence = self.fused_confidence;
        if let Some(pose) = obs.pose {
            self.orientation = Some(pose.orientation);
        }

        // Inverse-variance combination, floored so a track never becomes "certain".
        let obs_sigma = obs.accuracy.sigma_m();
        let inv = 1.0 / prior_sigma.max(1e-3).powi(2) + 1.0 / obs_sigma.max(1e-3).powi(2);
        self.sigma_m = (1.0 / inv).sqrt().max(0.02);
        self.weight = (w_prior + w_obs).min(cfg.max_prior_weight);

        // === 2. VELOCITY ===
        let s = cfg.velocity_smoothing;
        match obs.velocity {
            Some(v) if v.is_finite() => {
                self.velocity = self.velocity.blend(1.0 - s, &v, s);
            }
            _ => {
                if let Some((anchor_pos, anchor_at)) = self.velocity_anchor {
                    if at.millis_since(anchor_at) >= cfg.velocity_min_dt_ms {
                        let estimate = Velocity::between(&anchor_pos, &center, at.secs_since(anchor_at));
                        self.velocity = self.velocity.blend(1.0 - s, &estimate, s);
                        self.velocity_anchor = Some((center, at));
                    }
                } else {
                    self.velocity_anchor = Some((center, at));
                }
            }
        }

        // === 3. BOOKKEEPING ===
        let seen = self.contributors.entry(obs.camera_id.clone()).or_insert(at);
        if at > *seen {
            *seen = at;
        }
        if at > self.last_update {
            self.last_update = at;
        }
        self.hits = self.hits.saturating_add(1);
        self.misses = 0;
        self.matched_this_cycle = true;

        // === 4. CLASS / IDENTITY ===
        self.votes.push_back(ClassVote {
            class: if obs.is_marker() { EntityClass::Robot } else { class },
            weight: w_obs,
            confidence: obs.confidence,
            timestamp: at,
        });
        self.prune_votes(cfg.vote_window_ms);
        self.apply_identity(obs, cfg);

        // === 5. LIFECYCLE ===
        let from = self.state;
        let to = match from {
            TrackState::Tentative => {
                if at.millis_since(self.first_seen) <= cfg.confirmation_window_ms {
                    TrackState::Confirmed
                } else {
                    // Too late to count as a re-sighting; restart the window.
                    self.first_seen = at;
                    TrackState::Tentative
                }
            }
            TrackState::Coasting | TrackState::Confirmed => TrackState::Confirmed,
            TrackState::Lost => TrackState::Lost,
        };
        self.state = to;
        (from != to).then_some((from, to))
    }

    fn apply_identity(&mut self, obs: &Observation, cfg: &FusionConfig) {
        if let Some(robot_id) = &obs.robot_id {
            let task_id = obs
                .task_id
                .clone()
                .or_else(|| self.kind.identity().and_then(|i| i.task_id.clone()));
            self.kind = TrackKind::Robot {
                identity: Some(RobotIdentity { robot_id: robot_id.clone(), task_id }),
            };
            return;
        }
        // Marker identity is never downgraded by appearance-only votes.
        if self.kind.is_marker_locked() {
            return;
        }
        if let Some(class) = self.voted_class(cfg.high_confidence_vote) {
            self.kind = self.kind.relabel(class);
        }
        if let TrackKind::Obstacle { stationary } = &mut self.kind {
            *stationary = self.velocity.planar_speed() < cfg.stationary_speed;
        }
    }

    fn prune_votes(&mut self, window_ms: u64) {
        let newest = self.votes.iter().map(|v| v.timestamp).max().unwrap_or_default();
        self.votes.retain(|v| newest.millis_since(v.timestamp) <= window_ms);
    }

    /// Confidence-weighted vote over the window. Ties go to the class of the most
    /// recent high-confidence vote, falling back to the most recent vote.
    fn voted_class(&self, high_confidence: f32) -> Option<EntityClass> {
        let mut tally: BTreeMap<EntityClass, f64> = BTreeMap::new();
        for vote in &self.votes {
            *tally.entry(vote.class).or_insert(0.0) += vote.weight;
        }
        let best = tally.values().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !best.is_finite() {
            return None;
        }
        let tied: Vec<EntityClass> = tally
            .iter()
            .filter(|(_, w)| (best - **w).abs() <= 1e-9)
            .map(|(c, _)| *c)
            .collect();
        if tied.len() == 1 {
            return tied.first().copied();
        }
        let latest = |pred: &dyn Fn(&ClassVote) -> bool| {
            self.votes
                .iter()
                .filter(|v| tied.contains(&v.class) && pred(v))
                .max_by_key(|v| v.timestamp)
                .map(|v| v.class)
        };
        latest(&|v| v.confidence >= high_confidence).or_else(|| latest(&|_| true))
    }

    /// Extrapolate a coasting track to `now`; confidence decays with time unsupported.
    pub fn coast(&mut self, now: Timestamp, cfg: &FusionConfig) {
        let dt = now.secs_since(self.last_update).max(0.0);
        self.volume.center = self.predicted_position(now);
        self.confidence = (self.fused_confidence - cfg.coast_confidence_decay_per_s * dt as f32).max(0.0);
    }

    /// Absorb a duplicate track describing the same entity. `self` is the survivor.
    pub fn merge_from(&mut self, other: Track, cfg: &FusionConfig) {
        let w_s = self.weight;
        let w_o = other.weight;
        let at = self.last_update.max(other.last_update);
        let center_s = self.predicted_position(at);
        let center_o = other.predicted_position(at);

        self.fused_center = center_s.blend(w_s, &center_o, w_o);
        self.volume = BoundingVolume::new(
            self.fused_center,
            self.volume.extent.blend(w_s, &other.volume.extent, w_o),
        );
        self.velocity = self.velocity.blend(w_s, &other.velocity, w_o);
        self.fused_confidence = self.fused_confidence.max(other.fused_confidence);
        self.confidence = self.fused_confidence;
        self.sigma_m = self.sigma_m.min(other.sigma_m);
        self.weight = (w_s + w_o).min(cfg.max_prior_weight);
        if self.orientation.is_none() {
            self.orientation = other.orientation;
        }

        for (camera, seen) in other.contributors {
            let entry = self.contributors.entry(camera).or_insert(seen);
            if seen > *entry {
                *entry = seen;
            }
        }
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_update = at;
        self.hits = self.hits.saturating_add(other.hits);
        self.misses = self.misses.min(other.misses);
        self.matched_this_cycle |= other.matched_this_cycle;
        self.velocity_anchor = None;

        let mut votes: Vec<ClassVote> = self.votes.drain(..).chain(other.votes).collect();
        votes.sort_by_key(|v| v.timestamp);
        self.votes = votes.into();
        self.prune_votes(cfg.vote_window_ms);

        if other.kind.is_marker_locked() && !self.kind.is_marker_locked() {
            self.kind = other.kind;
        } else if !self.kind.is_marker_locked() {
            if let Some(class) = self.voted_class(cfg.high_confidence_vote) {
                self.kind = self.kind.relabel(class);
            }
        }

        // Independent corroboration: only two coasting tracks stay coasting.
        self.state = if self.state == TrackState::Coasting && other.state == TrackState::Coasting {
            TrackState::Coasting
        } else {
            TrackState::Confirmed
        };
    }

    /// Take over the camera contributions of an appearance-only duplicate of this
    /// robot. Pose and lifecycle stay with the marker.
    pub fn absorb_shadow(&mut self, other: Track) {
        for (camera, seen) in other.contributors {
            let entry = self.contributors.entry(camera).or_insert(seen);
            if seen > *entry {
                *entry = seen;
            }
        }
    }

    /// Drop contributions older than the window, always keeping the most recent camera.
    pub fn prune_contributors(&mut self, now: Timestamp, window_ms: u64) {
        if self.contributors.len() <= 1 {
            return;
        }
        let newest = self
            .contributors
            .iter()
            .max_by_key(|(_, seen)| **seen)
            .map(|(camera, _)| camera.clone());
        self.contributors
            .retain(|camera, seen| now.millis_since(*seen) <= window_ms || Some(camera) == newest.as_ref());
    }

    pub fn drop_camera(&mut self, camera_id: &str) {
        if self.contributors.len() > 1 {
            self.contributors.remove(camera_id);
        }
    }
}
