use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;

/// Position target in the local NED frame with optional feed-forward terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSetpoint {
    pub position: Vec3,
    pub velocity: Option<Vec3>,
    pub acceleration: Option<Vec3>,
    /// Heading in degrees, `None` keeps the current heading.
    pub yaw: Option<f64>,
}

impl PositionSetpoint {
    pub fn at(position: Vec3, yaw: Option<f64>) -> Self {
        Self { position, velocity: None, acceleration: None, yaw }
    }

    /// Same target without feed-forward terms, used to hold position.
    pub fn hold(&self) -> Self {
        Self::at(self.position, self.yaw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocitySetpoint {
    pub velocity: Vec3,
    /// Yaw rate in degrees per second.
    pub yaw_rate: f64,
}

/// What a follower asks the flight controller to do for one control tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ControlOutput {
    Position(PositionSetpoint),
    Velocity(VelocitySetpoint),
}
