//! Factory-frame geometry.
//!
//! The factory frame is metric, right-handed, with `z` pointing up from the
//! floor plane. Proximity and gating decisions are planar (x, y); height only
//! matters for bounding volumes.

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn planar(x: f64, y: f64) -> Self {
        Self { x, y, z: 0.0 }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn planar_distance(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Weighted blend: `(w_self * self + w_other * other) / (w_self + w_other)`.
    pub fn blend(&self, w_self: f64, other: &Position, w_other: f64) -> Position {
        let total = w_self + w_other;
        if total <= f64::EPSILON {
            return *other;
        }
        Position {
            x: (self.x * w_self + other.x * w_other) / total,
            y: (self.y * w_self + other.y * w_other) / total,
            z: (self.z * w_self + other.z * w_other) / total,
        }
    }

    pub fn advanced(&self, velocity: &Velocity, dt_secs: f64) -> Position {
        Position {
            x: self.x + velocity.x * dt_secs,
            y: self.y + velocity.y * dt_secs,
            z: self.z + velocity.z * dt_secs,
        }
    }

    pub fn to_point(&self) -> Point3<f64> {
        Point3::new(self.x, self.y, self.z)
    }

    pub fn from_point(p: &Point3<f64>) -> Self {
        Self { x: p.x, y: p.y, z: p.z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Velocity {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn planar_speed(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn between(from: &Position, to: &Position, dt_secs: f64) -> Velocity {
        if dt_secs <= 0.0 {
            return Velocity::default();
        }
        Velocity {
            x: (to.x - from.x) / dt_secs,
            y: (to.y - from.y) / dt_secs,
            z: (to.z - from.z) / dt_secs,
        }
    }

    pub fn blend(&self, w_self: f64, other: &Velocity, w_other: f64) -> Velocity {
        let total = w_self + w_other;
        if total <= f64::EPSILON {
            return *other;
        }
        Velocity {
            x: (self.x * w_self + other.x * w_other) / total,
            y: (self.y * w_self + other.y * w_other) / total,
            z: (self.z * w_self + other.z * w_other) / total,
        }
    }

    pub fn to_vector(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }
}

/// Roll / pitch / yaw in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl Orientation {
    pub fn is_finite(&self) -> bool {
        self.roll.is_finite() && self.pitch.is_finite() && self.yaw.is_finite()
    }
}

/// 6-DOF pose in the factory frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Position,
    pub orientation: Orientation,
}

/// Full sizes along the factory axes (metres).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Extent {
    pub width: f64,
    pub depth: f64,
    pub height: f64,
}

impl Extent {
    pub fn new(width: f64, depth: f64, height: f64) -> Self {
        Self { width, depth, height }
    }

    pub fn is_valid(&self) -> bool {
        [self.width, self.depth, self.height]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }

    pub fn blend(&self, w_self: f64, other: &Extent, w_other: f64) -> Extent {
        let total = w_self + w_other;
        if total <= f64::EPSILON {
            return *other;
        }
        Extent {
            width: (self.width * w_self + other.width * w_other) / total,
            depth: (self.depth * w_self + other.depth * w_other) / total,
            height: (self.height * w_self + other.height * w_other) / total,
        }
    }
}

/// Axis-aligned bounding volume centred on `center`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingVolume {
    pub center: Position,
    pub extent: Extent,
}

impl BoundingVolume {
    pub fn new(center: Position, extent: Extent) -> Self {
        Self { center, extent }
    }

    /// Planar footprint overlap test.
    pub fn overlaps(&self, other: &BoundingVolume) -> bool {
        let dx = (self.center.x - other.center.x).abs();
        let dy = (self.center.y - other.center.y).abs();
        dx <= (self.extent.width + other.extent.width) / 2.0
            && dy <= (self.extent.depth + other.extent.depth) / 2.0
    }

    /// Planar distance from a point to the footprint edge (0 when inside).
    pub fn planar_clearance(&self, p: &Position) -> f64 {
        let dx = ((p.x - self.center.x).abs() - self.extent.width / 2.0).max(0.0);
        let dy = ((p.y - self.center.y).abs() - self.extent.depth / 2.0).max(0.0);
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

/// Simple (non self-intersecting) polygon on the floor plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub vertices: Vec<Point2>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point2>) -> Self {
        Self { vertices }
    }

    pub fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self::new(vec![
            Point2 { x: min_x, y: min_y },
            Point2 { x: max_x, y: min_y },
            Point2 { x: max_x, y: max_y },
            Point2 { x: min_x, y: max_y },
        ])
    }

    pub fn is_valid(&self) -> bool {
        self.vertices.len() >= 3
            && self.vertices.iter().all(|v| v.x.is_finite() && v.y.is_finite())
            && self.area() > f64::EPSILON
    }

    pub fn area(&self) -> f64 {
        let n = self.vertices.len();
        if n < 3 {
            return 0.0;
        }
        let mut acc = 0.0;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            acc += a.x * b.y - b.x * a.y;
        }
        (acc / 2.0).abs()
    }

    /// Even-odd ray casting. Points on an edge count as inside.
    pub fn contains(&self, p: &Position) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        if self.edge_distance(p) <= 1e-9 {
            return true;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let vi = self.vertices[i];
            let vj = self.vertices[j];
            if (vi.y > p.y) != (vj.y > p.y) {
                let x_cross = (vj.x - vi.x) * (p.y - vi.y) / (vj.y - vi.y) + vi.x;
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Planar distance from `p` to the nearest polygon edge.
    pub fn edge_distance(&self, p: &Position) -> f64 {
        let n = self.vertices.len();
        let mut best = f64::INFINITY;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            let d = segment_distance(
                p,
                &Position::planar(a.x, a.y),
                &Position::planar(b.x, b.y),
            );
            best = best.min(d);
        }
        best
    }

    pub fn centroid(&self) -> Position {
        if self.vertices.is_empty() {
            return Position::default();
        }
        let n = self.vertices.len() as f64;
        let (sx, sy) = self
            .vertices
            .iter()
            .fold((0.0, 0.0), |(sx, sy), v| (sx + v.x, sy + v.y));
        Position::planar(sx / n, sy / n)
    }
}

/// Planar distance from `p` to the segment `a`-`b`.
pub fn segment_distance(p: &Position, a: &Position, b: &Position) -> f64 {
    let abx = b.x - a.x;
    let aby = b.y - a.y;
    let len_sq = abx * abx + aby * aby;
    if len_sq <= f64::EPSILON {
        return p.planar_distance(a);
    }
    let t = (((p.x - a.x) * abx + (p.y - a.y) * aby) / len_sq).clamp(0.0, 1.0);
    let proj = Position::planar(a.x + t * abx, a.y + t * aby);
    p.planar_distance(&proj)
}

/// Planar distance from `p` to a polyline (min over its segments).
pub fn polyline_distance(p: &Position, path: &[Position]) -> f64 {
    match path.len() {
        0 => f64::INFINITY,
        1 => p.planar_distance(&path[0]),
        _ => path
            .windows(2)
            .map(|w| segment_distance(p, &w[0], &w[1]))
            .fold(f64::INFINITY, f64::min),
    }
}

/// Truncate a polyline to its first `max_len` metres.
pub fn truncate_polyline(path: &[Position], max_len: f64) -> Vec<Position> {
    let mut out = Vec::new();
    let Some(first) = path.first() else {
        return out;
    };
    out.push(*first);
    let mut remaining = max_len;
    for w in path.windows(2) {
        if remaining <= 0.0 {
            break;
        }
        let seg = w[0].planar_distance(&w[1]);
        if seg <= remaining {
            out.push(w[1]);
            remaining -= seg;
        } else {
            let t = remaining / seg;
            out.push(Position::new(
                w[0].x + (w[1].x - w[0].x) * t,
                w[0].y + (w[1].y - w[0].y) * t,
                w[0].z + (w[1].z - w[0].z) * t,
            ));
            remaining = 0.0;
        }
    }
    out
}

/// Points sampled every `step` metres along a polyline, endpoints included.
pub fn sample_polyline(path: &[Position], step: f64) -> Vec<Position> {
    let mut out = Vec::new();
    let Some(first) = path.first() else {
        return out;
    };
    out.push(*first);
    let step = step.max(0.01);
    for w in path.windows(2) {
        let seg = w[0].planar_distance(&w[1]);
        let n = (seg / step).ceil().max(1.0) as usize;
        for i in 1..=n {
            let t = i as f64 / n as f64;
            out.push(Position::new(
                w[0].x + (w[1].x - w[0].x) * t,
                w[0].y + (w[1].y - w[0].y) * t,
                w[0].z + (w[1].z - w[0].z) * t,
            ));
        }
    }
    out
}
