//! Typed calibration records and the camera -> factory transforms built from them.
//!
//! Camera frame follows the pinhole convention: `z` forward along the optical
//! axis, `x` right, `y` down. Extrinsics give the camera pose in the factory
//! frame (camera-to-world).

use nalgebra::{Isometry3, Point3, Rotation3, Translation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;
use crate::kernel::event::{AccuracyClass, CameraId};
use crate::kernel::geometry::{Orientation, Position};
use crate::kernel::time::Timestamp;

/// Pinhole intrinsics with Brown-Conrady distortion `[k1, k2, p1, p2, k3]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub distortion: [f64; 5],
}

impl Intrinsics {
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: [0.0; 5],
        }
    }

    fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (x * radial + dx, y * radial + dy)
    }

    /// Pixel -> normalized image coordinates, undistorted by fixed-point iteration.
    pub fn normalize(&self, u: f64, v: f64) -> (f64, f64) {
        let xd = (u - self.cx) / self.fx;
        let yd = (v - self.cy) / self.fy;
        if self.distortion.iter().all(|c| *c == 0.0) {
            return (xd, yd);
        }
        let (mut x, mut y) = (xd, yd);
        for _ in 0..8 {
            let (dx, dy) = self.distort(x, y);
            x += xd - dx;
            y += yd - dy;
        }
        (x, y)
    }
}

/// Camera pose in the factory frame: roll/pitch/yaw (radians) and translation (metres).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Extrinsics {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub camera_id: CameraId,
    pub intrinsics: Intrinsics,
    pub extrinsics: Extrinsics,
    pub valid_from: Timestamp,
    /// Open-ended when absent.
    #[serde(default)]
    pub valid_until: Option<Timestamp>,
    /// World-frame accuracy of the transform (metres).
    pub accuracy_m: f64,
}

impl CalibrationRecord {
    /// Completeness check: every number finite, focal lengths and accuracy positive,
    /// validity window ordered and not already over.
    pub fn validate(&self, now: Timestamp) -> Result<(), CalibrationError> {
        let degenerate = |reason: &str| CalibrationError::Degenerate {
            camera_id: self.camera_id.clone(),
            reason: reason.to_string(),
        };
        if self.camera_id.trim().is_empty() {
            return Err(degenerate("empty camera id"));
        }
        let k = &self.intrinsics;
        if !(k.fx.is_finite() && k.fy.is_finite() && k.fx > 0.0 && k.fy > 0.0) {
            return Err(degenerate("focal lengths must be finite and positive"));
        }
        if !(k.cx.is_finite() && k.cy.is_finite()) || !k.distortion.iter().all(|c| c.is_finite()) {
            return Err(degenerate("principal point and distortion must be finite"));
        }
        let e = &self.extrinsics;
        if ![e.roll, e.pitch, e.yaw, e.x, e.y, e.z].iter().all(|v| v.is_finite()) {
            return Err(degenerate("extrinsics must be finite"));
        }
        if !(self.accuracy_m.is_finite() && self.accuracy_m > 0.0) {
            return Err(degenerate("accuracy must be finite and positive"));
        }
        if let Some(until) = self.valid_until {
            if until <= self.valid_from {
                return Err(degenerate("validity window is empty"));
            }
            if until <= now {
                return Err(CalibrationError::Expired {
                    camera_id: self.camera_id.clone(),
                    expired_at: until,
                });
            }
        }
        Ok(())
    }

    pub fn check_validity(&self, now: Timestamp) -> Result<(), CalibrationError> {
        if now < self.valid_from {
            return Err(CalibrationError::NotYetValid {
                camera_id: self.camera_id.clone(),
                valid_from: self.valid_from,
            });
        }
        match self.valid_until {
            Some(until) if until <= now => Err(CalibrationError::Expired {
                camera_id: self.camera_id.clone(),
                expired_at: until,
            }),
            _ => Ok(()),
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.valid_until.is_some_and(|until| until <= now)
    }

    pub fn accuracy_class(&self) -> AccuracyClass {
        AccuracyClass::from_metres(self.accuracy_m)
    }

    fn rotation(&self) -> Rotation3<f64> {
        let e = &self.extrinsics;
        Rotation3::from_euler_angles(e.roll, e.pitch, e.yaw)
    }

    pub fn camera_to_world(&self) -> Isometry3<f64> {
        let e = &self.extrinsics;
        Isometry3::from_parts(Translation3::new(e.x, e.y, e.z), self.rotation().into())
    }

    /// Metric camera-frame point -> factory frame.
    pub fn to_world(&self, p_cam: &Point3<f64>) -> Position {
        Position::from_point(&self.camera_to_world().transform_point(p_cam))
    }

    /// Camera-frame orientation -> factory frame.
    pub fn orientation_to_world(&self, o: &Orientation) -> Orientation {
        let local = Rotation3::from_euler_angles(o.roll, o.pitch, o.yaw);
        let (roll, pitch, yaw) = (self.rotation() * local).euler_angles();
        Orientation { roll, pitch, yaw }
    }

    /// Cast a pixel through the lens onto the floor plane (`z = 0`).
    /// `None` when the ray never reaches the floor in front of the camera.
    pub fn pixel_to_floor(&self, u: f64, v: f64) -> Option<Position> {
        let (x, y) = self.intrinsics.normalize(u, v);
        let origin = Vector3::new(self.extrinsics.x, self.extrinsics.y, self.extrinsics.z);
        let direction = self.rotation() * Vector3::new(x, y, 1.0);
        if direction.z >= -1e-9 {
            return None;
        }
        let s = -origin.z / direction.z;
        if !(s.is_finite() && s > 0.0) {
            return None;
        }
        let hit = origin + direction * s;
        Some(Position::new(hit.x, hit.y, 0.0))
    }

    /// Straight-line distance from the camera centre to a world point.
    pub fn range_to(&self, p: &Position) -> f64 {
        let e = &self.extrinsics;
        ((p.x - e.x).powi(2) + (p.y - e.y).powi(2) + (p.z - e.z).powi(2)).sqrt()
    }
}
