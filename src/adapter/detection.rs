use nalgebra::Point3;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{AdapterStats, LocalBox, RawDetection, RawFrame};
use crate::calibration::{CalibrationHandle, CalibrationRecord};
use crate::config::AdapterConfig;
use crate::error::CalibrationError;
use crate::kernel::event::{CameraId, Event, Observation, Severity, SystemEvent, SystemEventKind};
use crate::kernel::geometry::{Extent, Pose, Position};
use crate::kernel::time::Timestamp;
use crate::monitor::HealthSignal;

/// Channels an adapter task writes to.
#[derive(Debug, Clone)]
pub struct AdapterLinks {
    pub mailbox: mpsc::Sender<Event>,
    pub health: mpsc::Sender<HealthSignal>,
    pub events: mpsc::Sender<SystemEvent>,
    /// Best-effort copy of every forwarded observation for the bus.
    pub tap: Option<mpsc::Sender<Observation>>,
}

/// Normalizes one camera's raw detections into factory-frame observations.
pub struct DetectionAdapter {
    camera_id: CameraId,
    calibration: CalibrationHandle,
    config: AdapterConfig,
    stats: AdapterStats,
    pending: Vec<SystemEvent>,
    /// Set while a calibration failure episode is in progress.
    uncalibrated_since: Option<Timestamp>,
}

impl DetectionAdapter {
    pub fn new(calibration: CalibrationHandle, config: AdapterConfig) -> Self {
        Self {
            camera_id: calibration.camera_id().to_string(),
            calibration,
            config,
            stats: AdapterStats::default(),
            pending: Vec::new(),
            uncalibrated_since: None,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn stats(&self) -> &AdapterStats {
        &self.stats
    }

    pub fn take_events(&mut self) -> Vec<SystemEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Transform one frame. A frame from an uncalibrated camera is rejected whole.
    pub fn normalize(&mut self, frame: &RawFrame) -> Result<Vec<Observation>, CalibrationError> {
        self.stats.frames += 1;
        if frame.camera_id != self.camera_id {
            self.stats.foreign += 1;
            warn!("Adapter '{}' got a frame for '{}'; ignored", self.camera_id, frame.camera_id);
            return Ok(Vec::new());
        }

        let record = match self.calibration.current(frame.timestamp) {
            Ok(record) => {
                if self.uncalibrated_since.take().is_some() {
                    info!("Adapter '{}' calibrated again", self.camera_id);
                }
                record
            }
            Err(e) => {
                self.stats.uncalibrated += 1;
                if self.uncalibrated_since.is_none() {
                    warn!("Adapter '{}' rejecting frames: {}", self.camera_id, e);
                    self.uncalibrated_since = Some(frame.timestamp);
                    self.pending.push(SystemEvent::new(
                        e.event_kind(),
                        Severity::Warning,
                        self.camera_id.as_str(),
                        e.to_string(),
                        frame.timestamp,
                    ));
                }
                return Err(e);
            }
        };

        let mut observations = Vec::with_capacity(frame.detections.len());
        for detection in &frame.detections {
            self.stats.detections += 1;
            if detection.confidence() < self.config.confidence_floor {
                self.stats.below_floor += 1;
                continue;
            }
            match self.to_observation(detection, &record, frame.timestamp) {
                Some(obs) => observations.push(obs),
                None => {
                    self.stats.unprojectable += 1;
                    debug!("Adapter '{}': detection not projectable onto the floor", self.camera_id);
                }
            }
        }
        self.stats.emitted += observations.len() as u64;
        Ok(observations)
    }

    fn to_observation(&self, detection: &RawDetection, record: &CalibrationRecord, at: Timestamp) -> Option<Observation> {
        let accuracy = record.accuracy_class();
        match detection {
            RawDetection::Classified { class, bbox, confidence } => {
                let (position, extent) = Self::place_box(bbox, record)?;
                Some(Observation {
                    camera_id: self.camera_id.clone(),
                    timestamp: at,
                    position,
                    extent,
                    class: class.clone(),
                    confidence: *confidence,
                    robot_id: None,
                    task_id: None,
                    pose: None,
                    velocity: None,
                    accuracy,
                    trust: self.config.appearance_trust,
                })
            }
            RawDetection::Marker {
                robot_id,
                task_id,
                position,
                orientation,
                confidence,
                extent,
            } => {
                let [x, y, z] = *position;
                let world = record.to_world(&Point3::new(x, y, z));
                let orientation = record.orientation_to_world(orientation);
                Some(Observation {
                    camera_id: self.camera_id.clone(),
                    timestamp: at,
                    position: world,
                    extent: extent.unwrap_or(self.config.robot_footprint),
                    class: "robot".to_string(),
                    confidence: *confidence,
                    robot_id: Some(robot_id.clone()),
                    task_id: task_id.clone(),
                    pose: Some(Pose { position: world, orientation }),
                    velocity: None,
                    accuracy,
                    trust: self.config.marker_trust,
                })
            }
        }
    }

    /// Footprint centre and extent of a detection box in the factory frame.
    fn place_box(bbox: &LocalBox, record: &CalibrationRecord) -> Option<(Position, Extent)> {
        match *bbox {
            LocalBox::Metric { x, y, z, width, depth, height } => {
                Some((record.to_world(&Point3::new(x, y, z)), Extent::new(width, depth, height)))
            }
            LocalBox::Pixel { u_min, v_min, u_max, v_max } => {
                if !(u_max > u_min && v_max > v_min) {
                    return None;
                }
                // The bottom edge of the box is where the entity meets the floor.
                let contact = record.pixel_to_floor((u_min + u_max) / 2.0, v_max)?;
                let left = record.pixel_to_floor(u_min, v_max)?;
                let right = record.pixel_to_floor(u_max, v_max)?;
                let width = left.planar_distance(&right);
                let height = (v_max - v_min) / record.intrinsics.fy * record.range_to(&contact);
                let mut center = contact;
                center.z = height / 2.0;
                Some((center, Extent::new(width, width, height)))
            }
        }
    }

    /// Lazily normalize a frame stream. Rejected frames contribute nothing.
    pub fn observations<'a, I>(&'a mut self, frames: I) -> impl Iterator<Item = Observation> + 'a
    where
        I: IntoIterator<Item = RawFrame>,
        I::IntoIter: 'a,
    {
        frames
            .into_iter()
            .flat_map(move |frame| self.normalize(&frame).unwrap_or_default())
    }

    /// Per-camera task: heartbeat the monitor per frame, forward observations to the
    /// fusion mailbox. A full mailbox is reported and waited on, never dropped.
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<RawFrame>,
        links: AdapterLinks,
        cancel: CancellationToken,
    ) -> AdapterStats {
        info!("Adapter '{}' started", self.camera_id);
        let mut overloaded = false;

        'frames: loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let _ = links
                .health
                .send(HealthSignal::Frame {
                    camera_id: self.camera_id.clone(),
                    at: Timestamp::now(),
                })
                .await;

            let observations = self.normalize(&frame).unwrap_or_default();
            for event in self.take_events() {
                let _ = links.events.send(event).await;
            }

            for obs in observations {
                if let Some(tap) = &links.tap {
                    let _ = tap.try_send(obs.clone());
                }
                match links.mailbox.try_send(Event::Observation(obs)) {
                    Ok(()) => overloaded = false,
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        self.stats.overloads += 1;
                        if !overloaded {
                            overloaded = true;
                            warn!("Fusion mailbox full; adapter '{}' waiting", self.camera_id);
                            let _ = links.events.try_send(SystemEvent::new(
                                SystemEventKind::MailboxOverload,
                                Severity::Warning,
                                self.camera_id.as_str(),
                                "fusion mailbox full; adapter applying backpressure",
                                Timestamp::now(),
                            ));
                        }
                        let sent = tokio::select! {
                            _ = cancel.cancelled() => false,
                            res = links.mailbox.send(event) => res.is_ok(),
                        };
                        if !sent {
                            break 'frames;
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break 'frames,
                }
            }
        }

        let _ = links
            .health
            .send(HealthSignal::Disconnected {
                camera_id: self.camera_id.clone(),
                at: Timestamp::now(),
            })
            .await;
        info!("Adapter '{}' stopped: {:?}", self.camera_id, self.stats);
        self.stats
    }
}
