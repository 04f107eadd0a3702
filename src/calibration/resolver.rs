use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::record::CalibrationRecord;
use super::store::CalibrationStore;
use crate::error::CalibrationError;
use crate::kernel::event::{CameraId, Severity, SystemEvent, SystemEventKind};
use crate::kernel::time::Timestamp;

type Slot = Option<Arc<CalibrationRecord>>;

/// Read-only view of one camera's calibration, handed to that camera's adapter.
#[derive(Debug, Clone)]
pub struct CalibrationHandle {
    camera_id: CameraId,
    rx: watch::Receiver<Slot>,
}

impl CalibrationHandle {
    /// A handle pinned to one record, for embedding and tests.
    pub fn fixed(record: CalibrationRecord) -> Self {
        let camera_id = record.camera_id.clone();
        let (_tx, rx) = watch::channel(Some(Arc::new(record)));
        Self { camera_id, rx }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// The record usable at `now`.
    pub fn current(&self, now: Timestamp) -> Result<Arc<CalibrationRecord>, CalibrationError> {
        let slot = self.rx.borrow();
        match slot.as_ref() {
            Some(record) => {
                record.check_validity(now)?;
                Ok(Arc::clone(record))
            }
            None => Err(CalibrationError::NotCalibrated {
                camera_id: self.camera_id.clone(),
            }),
        }
    }
}

/// Holds every camera's current calibration and fans updates out to adapters.
#[derive(Debug, Default)]
pub struct CalibrationResolver {
    records: HashMap<CameraId, Arc<CalibrationRecord>>,
    channels: HashMap<CameraId, watch::Sender<Slot>>,
    /// Cameras whose current missing/expired/rejected episode was already reported.
    reported: HashSet<CameraId>,
}

impl CalibrationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, camera_id: &str, now: Timestamp) -> Result<Arc<CalibrationRecord>, CalibrationError> {
        let record = self
            .records
            .get(camera_id)
            .ok_or_else(|| CalibrationError::NotCalibrated {
                camera_id: camera_id.to_string(),
            })?;
        record.check_validity(now)?;
        Ok(Arc::clone(record))
    }

    /// Validate and install a record. Returns a `CalibrationRestored` event when this
    /// ends a reported episode.
    pub fn update(&mut self, record: CalibrationRecord, now: Timestamp) -> Result<Option<SystemEvent>, CalibrationError> {
        record.validate(now)?;
        let camera_id = record.camera_id.clone();
        if self.records.get(&camera_id).is_some_and(|r| **r == record) {
            return Ok(None);
        }
        info!("Calibration installed for '{}' (accuracy {:.3}m)", camera_id, record.accuracy_m);
        let record = Arc::new(record);
        self.records.insert(camera_id.clone(), Arc::clone(&record));
        self.publish(&camera_id, Some(record));

        Ok(self.reported.remove(&camera_id).then(|| {
            SystemEvent::new(
                SystemEventKind::CalibrationRestored,
                Severity::Info,
                camera_id.as_str(),
                "valid calibration available",
                now,
            )
        }))
    }

    /// Fetch, decode and install a camera's record from the store.
    pub fn load(
        &mut self,
        store: &dyn CalibrationStore,
        camera_id: &str,
        now: Timestamp,
    ) -> Result<Option<SystemEvent>, CalibrationError> {
        let raw = store.get(camera_id)?.ok_or_else(|| CalibrationError::NotCalibrated {
            camera_id: camera_id.to_string(),
        })?;
        let record: CalibrationRecord = serde_json::from_str(&raw).map_err(|e| CalibrationError::Decode {
            camera_id: camera_id.to_string(),
            reason: e.to_string(),
        })?;
        if record.camera_id != camera_id {
            return Err(CalibrationError::Decode {
                camera_id: camera_id.to_string(),
                reason: format!("document is for camera '{}'", record.camera_id),
            });
        }
        self.update(record, now)
    }

    /// Subscribe to a camera's calibration. The handle sees every later update.
    pub fn watch(&mut self, camera_id: &str) -> CalibrationHandle {
        let rx = match self.channels.get(camera_id) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(self.records.get(camera_id).cloned());
                self.channels.insert(camera_id.to_string(), tx);
                rx
            }
        };
        CalibrationHandle {
            camera_id: camera_id.to_string(),
            rx,
        }
    }

    /// Drop expired records, one `CalibrationExpired` event each.
    pub fn sweep(&mut self, now: Timestamp) -> Vec<SystemEvent> {
        let expired: Vec<CameraId> = self
            .records
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut events = Vec::new();
        for camera_id in expired {
            if let Some(record) = self.records.remove(&camera_id) {
                warn!("Calibration for '{}' expired", camera_id);
                self.publish(&camera_id, None);
                self.reported.insert(camera_id.clone());
                let until = record.valid_until.unwrap_or(now);
                events.push(SystemEvent::new(
                    SystemEventKind::CalibrationExpired,
                    Severity::Warning,
                    camera_id.as_str(),
                    format!("calibration expired at {}", until),
                    now,
                ));
            }
        }
        events
    }

    /// Event for a failed load, at most once per episode. Missing records are left
    /// to the adapters, which report them when frames actually arrive.
    pub fn report_failure(&mut self, camera_id: &str, error: &CalibrationError, now: Timestamp) -> Option<SystemEvent> {
        if matches!(error, CalibrationError::NotCalibrated { .. }) {
            debug!("No calibration for '{}' yet", camera_id);
            return None;
        }
        if !self.reported.insert(camera_id.to_string()) {
            return None;
        }
        warn!("Calibration for '{}' rejected: {}", camera_id, error);
        let severity = match error.event_kind() {
            SystemEventKind::CalibrationExpired => Severity::Warning,
            _ => Severity::Critical,
        };
        Some(SystemEvent::new(error.event_kind(), severity, camera_id, error.to_string(), now))
    }

    /// Reload every camera from the store and sweep expiries.
    pub fn refresh(&mut self, store: &dyn CalibrationStore, cameras: &[CameraId], now: Timestamp) -> Vec<SystemEvent> {
        let mut events = self.sweep(now);
        for camera_id in cameras {
            match self.load(store, camera_id, now) {
                Ok(restored) => events.extend(restored),
                Err(e) => events.extend(self.report_failure(camera_id, &e, now)),
            }
        }
        events
    }

    fn publish(&self, camera_id: &str, slot: Slot) {
        if let Some(tx) = self.channels.get(camera_id) {
            tx.send_replace(slot);
        }
    }

    /// Periodic refresh task. Owns the resolver; adapters keep their handles.
    pub async fn run(
        mut self,
        store: Arc<dyn CalibrationStore>,
        cameras: Vec<CameraId>,
        every: Duration,
        events: mpsc::Sender<SystemEvent>,
        cancel: CancellationToken,
    ) {
        info!("Calibration refresh started for {} cameras every {}ms", cameras.len(), every.as_millis());
        let mut cadence = interval(every);
        cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = cadence.tick() => {}
            }
            for event in self.refresh(store.as_ref(), &cameras, Timestamp::now()) {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
        info!("Calibration refresh stopped");
    }
}
