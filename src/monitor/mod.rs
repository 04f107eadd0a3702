//! Per-camera liveness and staleness watching.

pub mod monitor;
pub mod types;

pub use monitor::HealthMonitor;
pub use types::{HealthSignal, StatusChange};
