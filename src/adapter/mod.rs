//! Detection adapters: one per camera, raw inference output in, factory-frame
//! observations out.

pub mod detection;
pub mod types;

pub use detection::{AdapterLinks, DetectionAdapter};
pub use types::{AdapterStats, LocalBox, RawDetection, RawFrame};
