use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{HealthSignal, StatusChange};
use crate::config::HealthConfig;
use crate::kernel::event::{CameraId, Event, Liveness, Severity, SystemEvent, SystemEventKind};
use crate::kernel::time::Timestamp;

#[derive(Debug, Clone)]
struct CameraHealth {
    last_seen: Option<Timestamp>,
    liveness: Liveness,
    registered_at: Timestamp,
}

/// Passive liveness watcher.
///
/// Adapters feed it evidence; `tick` turns silence into Offline transitions.
/// Recovery is immediate on resumed input. Only transitions are reported.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    cameras: BTreeMap<CameraId, CameraHealth>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            cameras: BTreeMap::new(),
        }
    }

    /// Start watching a camera. It is presumed Online until its liveness window
    /// passes without input.
    pub fn register(&mut self, camera_id: &str, now: Timestamp) {
        self.cameras.entry(camera_id.to_string()).or_insert(CameraHealth {
            last_seen: None,
            liveness: Liveness::Online,
            registered_at: now,
        });
    }

    pub fn liveness(&self, camera_id: &str) -> Option<Liveness> {
        self.cameras.get(camera_id).map(|c| c.liveness)
    }

    pub fn last_seen(&self, camera_id: &str) -> Option<Timestamp> {
        self.cameras.get(camera_id).and_then(|c| c.last_seen)
    }

    /// Apply one piece of evidence, returning the transition it causes.
    pub fn observe(&mut self, signal: &HealthSignal) -> Option<StatusChange> {
        match signal {
            HealthSignal::Frame { camera_id, at } => {
                let camera = self
                    .cameras
                    .entry(camera_id.clone())
                    .or_insert(CameraHealth {
                        last_seen: None,
                        liveness: Liveness::Online,
                        registered_at: *at,
                    });
                if camera.last_seen.map_or(true, |prev| *at > prev) {
                    camera.last_seen = Some(*at);
                }
                if camera.liveness == Liveness::Online {
                    return None;
                }
                let from = camera.liveness;
                camera.liveness = Liveness::Online;
                Some(StatusChange {
                    camera_id: camera_id.clone(),
                    from,
                    to: Liveness::Online,
                    at: *at,
                    silent_ms: 0,
                })
            }
            HealthSignal::Disconnected { camera_id, at } => {
                let camera = self.cameras.get_mut(camera_id)?;
                if camera.liveness == Liveness::Offline {
                    return None;
                }
                let from = camera.liveness;
                camera.liveness = Liveness::Offline;
                Some(StatusChange {
                    camera_id: camera_id.clone(),
                    from,
                    to: Liveness::Offline,
                    at: *at,
                    silent_ms: 0,
                })
            }
        }
    }

    /// Mark every camera silent for longer than the liveness window Offline.
    pub fn tick(&mut self, now: Timestamp) -> Vec<StatusChange> {
        let window = self.config.liveness_window_ms;
        let mut changes = Vec::new();
        for (camera_id, camera) in self.cameras.iter_mut() {
            if camera.liveness != Liveness::Online {
                continue;
            }
            let reference = camera.last_seen.unwrap_or(camera.registered_at);
            let silent_ms = now.millis_since(reference);
            if silent_ms > window {
                camera.liveness = Liveness::Offline;
                changes.push(StatusChange {
                    camera_id: camera_id.clone(),
                    from: Liveness::Online,
                    to: Liveness::Offline,
                    at: now,
                    silent_ms,
                });
            }
        }
        changes
    }

    pub fn system_event(change: &StatusChange) -> SystemEvent {
        match change.to {
            Liveness::Online => SystemEvent::new(
                SystemEventKind::CameraOnline,
                Severity::Info,
                change.camera_id.as_str(),
                "input resumed",
                change.at,
            ),
            _ if change.silent_ms > 0 => SystemEvent::new(
                SystemEventKind::CameraOffline,
                Severity::Warning,
                change.camera_id.as_str(),
                format!("no input for {}ms", change.silent_ms),
                change.at,
            ),
            _ => SystemEvent::new(
                SystemEventKind::CameraOffline,
                Severity::Warning,
                change.camera_id.as_str(),
                "adapter disconnected",
                change.at,
            ),
        }
    }

    /// Monitor task. Status changes go to the fusion mailbox, events to the event queue.
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<HealthSignal>,
        mailbox: mpsc::Sender<Event>,
        events: mpsc::Sender<SystemEvent>,
        cancel: CancellationToken,
    ) {
        info!(
            "Health monitor started: {} cameras, window {}ms, tick {}ms",
            self.cameras.len(),
            self.config.liveness_window_ms,
            self.config.tick_interval_ms
        );
        let mut cadence = interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut signals_open = true;

        loop {
            let changes = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = cadence.tick() => self.tick(Timestamp::now()),
                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) => self.observe(&signal).into_iter().collect(),
                    None => {
                        debug!("All adapters gone; monitor continues on its tick");
                        signals_open = false;
                        Vec::new()
                    }
                },
            };

            for change in changes {
                match change.to {
                    Liveness::Online => info!("Camera '{}' online", change.camera_id),
                    _ => warn!("Camera '{}' offline", change.camera_id),
                }
                let _ = events.send(Self::system_event(&change)).await;
                let status = Event::CameraStatus {
                    camera_id: change.camera_id,
                    liveness: change.to,
                    at: change.at,
                };
                if mailbox.send(status).await.is_err() {
                    info!("Fusion mailbox closed; health monitor stopping");
                    return;
                }
            }
        }
        info!("Health monitor stopped");
    }
}
