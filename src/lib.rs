//! Multi-camera track fusion and navigation arbitration for factory-floor robots.

pub mod adapter;
pub mod calibration;
pub mod config;
pub mod error;
pub mod kernel;
pub mod monitor;
pub mod navigation;
pub mod publisher;

pub use kernel::fusion::FusionEngine;
pub use kernel::reactor::Reactor;
