//! Per-camera calibration: typed records, stores, and the resolver that hands
//! each adapter a live read-only view.

pub mod record;
pub mod resolver;
pub mod store;

pub use record::{CalibrationRecord, Extrinsics, Intrinsics};
pub use resolver::{CalibrationHandle, CalibrationResolver};
pub use store::{CalibrationStore, DirectoryCalibrationStore, MemoryCalibrationStore};
