//! Navigation arbitration: world snapshots and robot goals in, guidance out.

pub mod arbitrator;
pub mod types;

pub use arbitrator::{Arbitration, NavigationArbitrator};
pub use types::{Directive, GuidanceCommand, Hazard, NavigationControl, ReasonCode, RobotGoal};
