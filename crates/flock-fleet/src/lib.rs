//! Fleet core: per-drone command scheduling, control loops and the registry
//! that fans operations out across drones.

pub mod command;
mod control;
pub mod drone;
pub mod error;
pub mod fleet;
pub mod scheduler;

pub use command::{Command, CommandHandle, CommandReport};
pub use drone::{Drone, DroneConfig, DroneStatus};
pub use error::{CommandError, FleetError};
pub use fleet::FleetManager;
pub use scheduler::{CommandScheduler, SchedulerStatus};
