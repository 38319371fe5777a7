use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geometry::Vec3;

/// A command that can be submitted to one drone.
///
/// Positions are local NED meters, headings degrees, durations seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandSpec {
    Arm,
    Disarm,
    Takeoff { altitude: f64 },
    Land,
    FlyTo { target: Vec3, yaw: Option<f64>, tolerance: f64 },
    /// Ordered waypoints flown as one smooth multi-segment trajectory.
    FollowPath { waypoints: Vec<Vec3>, yaw: Option<f64>, tolerance: f64 },
    /// Offset relative to the position at the moment the command starts.
    Move { offset: Vec3, yaw: Option<f64>, tolerance: f64 },
    /// Turn in place.
    Yaw { yaw: f64, tolerance: f64 },
    /// Raw velocity for a fixed time, then hold.
    Velocity { velocity: Vec3, yaw_rate: f64, seconds: f64 },
    Wait { seconds: f64 },
    /// Autopilot flight mode by name, e.g. `HOLD`.
    FlightMode { mode: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Arm,
    Disarm,
    Takeoff,
    Land,
    FlyTo,
    FollowPath,
    Move,
    Yaw,
    Velocity,
    Wait,
    FlightMode,
}

impl CommandSpec {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandSpec::Arm => CommandKind::Arm,
            CommandSpec::Disarm => CommandKind::Disarm,
            CommandSpec::Takeoff { .. } => CommandKind::Takeoff,
            CommandSpec::Land => CommandKind::Land,
            CommandSpec::FlyTo { .. } => CommandKind::FlyTo,
            CommandSpec::FollowPath { .. } => CommandKind::FollowPath,
            CommandSpec::Move { .. } => CommandKind::Move,
            CommandSpec::Yaw { .. } => CommandKind::Yaw,
            CommandSpec::Velocity { .. } => CommandKind::Velocity,
            CommandSpec::Wait { .. } => CommandKind::Wait,
            CommandSpec::FlightMode { .. } => CommandKind::FlightMode,
        }
    }

    pub fn fly_to(target: Vec3, yaw: Option<f64>, tolerance: f64) -> Self {
        CommandSpec::FlyTo { target, yaw, tolerance }
    }
}

impl CommandKind {
    /// Movement commands run a navigation session.
    pub fn is_movement(self) -> bool {
        matches!(self, CommandKind::FlyTo | CommandKind::FollowPath | CommandKind::Move | CommandKind::Yaw)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Arm => "arm",
            CommandKind::Disarm => "disarm",
            CommandKind::Takeoff => "takeoff",
            CommandKind::Land => "land",
            CommandKind::FlyTo => "flyto",
            CommandKind::FollowPath => "path",
            CommandKind::Move => "move",
            CommandKind::Yaw => "yaw",
            CommandKind::Velocity => "velocity",
            CommandKind::Wait => "wait",
            CommandKind::FlightMode => "mode",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Succeeded | CommandStatus::Failed | CommandStatus::Canceled)
    }
}
