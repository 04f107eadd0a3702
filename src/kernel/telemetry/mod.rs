//! Fusion telemetry.
//!
//! Telemetry is a read-only side channel. Nothing in association, lifecycle or
//! arbitration reads it back; it exists for operators and tests.
//! Events carry identifiers, reasons and counts only.

pub mod event;
pub mod metrics;
pub mod recorder;

pub use event::{DropReason, TelemetryEvent};
pub use metrics::TelemetrySnapshot;
pub use recorder::TelemetryRecorder;
