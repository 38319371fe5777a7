//! Trajectory navigation for one drone: geofence, path generators, path
//! followers and the session that binds them to a running movement command.

pub mod doctor;
pub mod fence;
pub mod follower;
pub mod generator;
pub mod gmp3;
pub mod jerk;
pub mod session;

pub use fence::{FenceConfig, FenceEngine, FenceError, FenceMode, FenceVerdict, RectLocalFence};
pub use follower::{PathFollower, VelocityFollower};
pub use generator::{DirectTarget, PathGenerator};
pub use gmp3::Gmp3Generator;
pub use jerk::JerkLimitedFollower;
pub use session::NavigationSession;

use serde::Deserialize;

/// Velocity, acceleration and jerk bound for one axis group.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AxisLimits {
    pub velocity: f64,
    pub acceleration: f64,
    pub jerk: f64,
}

/// Kinematic bounds shared by the generators and followers.
///
/// North and east use `horizontal`, down uses `vertical`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct KinematicLimits {
    pub horizontal: AxisLimits,
    pub vertical: AxisLimits,
}

impl Default for KinematicLimits {
    fn default() -> Self {
        Self {
            horizontal: AxisLimits { velocity: 10.0, acceleration: 2.0, jerk: 1.0 },
            vertical: AxisLimits { velocity: 1.0, acceleration: 0.5, jerk: 1.0 },
        }
    }
}

impl KinematicLimits {
    pub fn axis(&self, axis: usize) -> AxisLimits {
        if axis == 2 { self.vertical } else { self.horizontal }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowerKind {
    /// Forward generator setpoints, the flight controller smooths.
    #[default]
    Direct,
    JerkLimited,
    /// Saturated P-control on position error, for degraded position estimates.
    Velocity,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NavConfig {
    pub follower: FollowerKind,
    /// Default position tolerance, meters
    pub tolerance: f64,
    /// Heading tolerance, degrees
    pub yaw_tolerance: f64,
    /// Proportional gain of the velocity follower, 1/s
    pub velocity_gain: f64,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self { follower: FollowerKind::Direct, tolerance: 0.25, yaw_tolerance: 5.0, velocity_gain: 1.0 }
    }
}
