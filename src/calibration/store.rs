use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::RwLock;

use super::record::CalibrationRecord;
use crate::error::CalibrationError;
use crate::kernel::event::CameraId;

/// Key-value source of raw calibration documents (JSON), keyed by camera id.
pub trait CalibrationStore: Send + Sync {
    /// `Ok(None)` when the store has no entry for the camera.
    fn get(&self, camera_id: &str) -> Result<Option<String>, CalibrationError>;
}

#[derive(Debug, Default)]
pub struct MemoryCalibrationStore {
    entries: RwLock<HashMap<CameraId, String>>,
}

impl MemoryCalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_raw(&self, camera_id: &str, raw: impl Into<String>) -> Result<(), CalibrationError> {
        self.entries
            .write()
            .map_err(|_| CalibrationError::Store("memory store lock poisoned".to_string()))?
            .insert(camera_id.to_string(), raw.into());
        Ok(())
    }

    pub fn insert(&self, record: &CalibrationRecord) -> Result<(), CalibrationError> {
        let raw = serde_json::to_string(record).map_err(|e| CalibrationError::Decode {
            camera_id: record.camera_id.clone(),
            reason: e.to_string(),
        })?;
        self.insert_raw(&record.camera_id, raw)
    }

    pub fn remove(&self, camera_id: &str) -> Result<(), CalibrationError> {
        self.entries
            .write()
            .map_err(|_| CalibrationError::Store("memory store lock poisoned".to_string()))?
            .remove(camera_id);
        Ok(())
    }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn get(&self, camera_id: &str) -> Result<Option<String>, CalibrationError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| CalibrationError::Store("memory store lock poisoned".to_string()))?;
        Ok(entries.get(camera_id).cloned())
    }
}

/// One `<camera_id>.json` document per camera under a directory.
#[derive(Debug, Clone)]
pub struct DirectoryCalibrationStore {
    dir: PathBuf,
}

impl DirectoryCalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, camera_id: &str) -> Option<PathBuf> {
        // Camera ids become file names; refuse anything that could leave the directory.
        if camera_id.is_empty() || camera_id.contains(['/', '\\']) || camera_id.starts_with('.') {
            return None;
        }
        Some(self.dir.join(format!("{}.json", camera_id)))
    }
}

impl CalibrationStore for DirectoryCalibrationStore {
    fn get(&self, camera_id: &str) -> Result<Option<String>, CalibrationError> {
        let Some(path) = self.path_for(camera_id) else {
            return Err(CalibrationError::Store(format!("invalid camera id '{}'", camera_id)));
        };
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CalibrationError::Store(format!("{}: {}", path.display(), e))),
        }
    }
}
