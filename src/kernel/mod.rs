pub mod event;
pub mod fusion;
pub mod geometry;
pub mod reactor;
pub mod snapshot;
pub mod state;
pub mod telemetry;
pub mod time;
pub mod track;
pub mod zone;
