//! Data model shared by every flock crate: NED geometry, telemetry samples,
//! setpoints, command specifications and the event feed.

pub mod command;
pub mod event;
pub mod geometry;
pub mod setpoint;
pub mod telemetry;

pub use command::{CommandKind, CommandSpec, CommandStatus};
pub use event::{unix_ms_now, EventKind, FleetEvent};
pub use geometry::{heading_error_deg, Vec3};
pub use setpoint::{ControlOutput, PositionSetpoint, VelocitySetpoint};
pub use telemetry::{Attitude, ConnectionState, TelemetrySample};
