//! Message bus output: snapshots, guidance and system events.

pub mod publisher;
pub mod sink;

pub use publisher::{Publisher, PublisherInputs, PublisherStats, RetryPolicy};
pub use sink::{BusMessage, BusSink, JsonLinesSink, MemorySink};
