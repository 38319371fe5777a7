use flock_proto::{PositionSetpoint, Vec3};

use crate::gmp3::Gmp3Generator;
use crate::KinematicLimits;

/// Single-setpoint "trajectory": the goal itself, smoothing is left to the follower.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectTarget {
    goal: PositionSetpoint,
    emitted: bool,
}

impl DirectTarget {
    pub fn new(goal: PositionSetpoint) -> Self {
        Self { goal, emitted: false }
    }

    pub fn next_setpoint(&mut self) -> Option<PositionSetpoint> {
        if self.emitted {
            return None;
        }
        self.emitted = true;
        Some(self.goal)
    }
}

/// Lazy, finite and restartable source of intermediate setpoints.
#[derive(Debug, Clone)]
pub enum PathGenerator {
    Direct(DirectTarget),
    Gmp3(Gmp3Generator),
}

impl PathGenerator {
    pub fn direct(target: Vec3, yaw: Option<f64>) -> Self {
        PathGenerator::Direct(DirectTarget::new(PositionSetpoint::at(target, yaw)))
    }

    /// Minimum-jerk path through `waypoints`; a single waypoint is a plain target.
    pub fn path(start: Vec3, waypoints: Vec<Vec3>, yaw: Option<f64>, limits: KinematicLimits) -> Self {
        match waypoints.as_slice() {
            [] => Self::direct(start, yaw),
            [only] => Self::direct(*only, yaw),
            _ => PathGenerator::Gmp3(Gmp3Generator::new(start, waypoints, yaw, limits)),
        }
    }

    /// Next setpoint for a tick of length `dt`, `None` once exhausted.
    pub fn next_setpoint(&mut self, dt: f64) -> Option<PositionSetpoint> {
        match self {
            PathGenerator::Direct(d) => d.next_setpoint(),
            PathGenerator::Gmp3(g) => g.next_setpoint(dt),
        }
    }

    pub fn final_setpoint(&self) -> PositionSetpoint {
        match self {
            PathGenerator::Direct(d) => d.goal,
            PathGenerator::Gmp3(g) => g.final_setpoint(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        match self {
            PathGenerator::Direct(d) => d.emitted,
            PathGenerator::Gmp3(g) => g.is_finished(),
        }
    }

    pub fn restart(&mut self) {
        match self {
            PathGenerator::Direct(d) => d.emitted = false,
            PathGenerator::Gmp3(g) => g.restart(),
        }
    }

    /// Continues from `position` after the vehicle was held off the path.
    pub fn resume_from(&mut self, position: Vec3) {
        if let PathGenerator::Gmp3(g) = self {
            g.resume_from(position);
        }
    }

    /// Swaps the remaining waypoints. A running GMP3 path replans from its
    /// current state; a direct target is replaced by a new path from `position`.
    pub fn replace_waypoints(&mut self, waypoints: Vec<Vec3>, position: Vec3, limits: KinematicLimits) {
        if waypoints.is_empty() {
            return;
        }
        match self {
            PathGenerator::Gmp3(g) => g.replace_waypoints(waypoints),
            PathGenerator::Direct(d) => {
                let yaw = d.goal.yaw;
                *self = Self::path(position, waypoints, yaw, limits);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(g: &mut PathGenerator) -> Vec<PositionSetpoint> {
        std::iter::from_fn(|| g.next_setpoint(0.05)).take(100_000).collect()
    }

    #[test]
    fn single_waypoint_path_equals_direct_target() {
        let w0 = Vec3::new(10.0, 0.0, -2.0);
        let mut path = PathGenerator::path(Vec3::ZERO, vec![w0], Some(-90.0), KinematicLimits::default());
        let mut direct = PathGenerator::direct(w0, Some(-90.0));

        assert_eq!(path.final_setpoint(), direct.final_setpoint());
        assert_eq!(drain(&mut path), drain(&mut direct));
        assert_eq!(drain(&mut path), vec![]);
        assert!(path.is_exhausted() && direct.is_exhausted());

        path.restart();
        direct.restart();
        assert_eq!(drain(&mut path), drain(&mut direct));
    }

    #[test]
    fn direct_target_yields_once() {
        let mut g = PathGenerator::direct(Vec3::new(1.0, 2.0, -3.0), None);
        assert_eq!(g.next_setpoint(0.05), Some(PositionSetpoint::at(Vec3::new(1.0, 2.0, -3.0), None)));
        assert_eq!(g.next_setpoint(0.05), None);
    }

    #[test]
    fn multi_waypoint_path_ends_at_last_waypoint() {
        let wps = vec![Vec3::new(3.0, 0.0, -2.0), Vec3::new(3.0, 3.0, -2.0)];
        let mut g = PathGenerator::path(Vec3::new(0.0, 0.0, -2.0), wps, None, KinematicLimits::default());
        assert!(matches!(g, PathGenerator::Gmp3(_)));
        let out = drain(&mut g);
        assert!(out.len() > 1);
        assert_eq!(out.last().map(|s| s.position), Some(Vec3::new(3.0, 3.0, -2.0)));
    }
}
