use flock_proto::{heading_error_deg, ControlOutput, PositionSetpoint, TelemetrySample, Vec3};

use crate::follower::PathFollower;
use crate::generator::PathGenerator;
use crate::KinematicLimits;

/// Navigation state of one running movement command.
///
/// Each tick pulls the next generator setpoint, hands it to the follower and
/// updates the "reached" debounce. Owned by the drone's control loop and
/// dropped when the command ends.
#[derive(Debug)]
pub struct NavigationSession {
    generator: PathGenerator,
    follower: PathFollower,
    limits: KinematicLimits,
    tolerance: f64,
    yaw_tolerance: f64,
    debounce_ticks: u32,
    settled: u32,
    target: Option<PositionSetpoint>,
    last_output: Option<ControlOutput>,
}

impl NavigationSession {
    pub fn new(
        generator: PathGenerator,
        follower: PathFollower,
        limits: KinematicLimits,
        tolerance: f64,
        yaw_tolerance: f64,
        debounce_ticks: u32,
    ) -> Self {
        Self {
            generator,
            follower,
            limits,
            tolerance,
            yaw_tolerance,
            debounce_ticks: debounce_ticks.max(1),
            settled: 0,
            target: None,
            last_output: None,
        }
    }

    pub fn tick(&mut self, sample: &TelemetrySample, dt: f64) -> ControlOutput {
        if let Some(sp) = self.generator.next_setpoint(dt) {
            self.target = Some(sp);
        }
        let target = self.target.unwrap_or_else(|| self.generator.final_setpoint());
        let out = self.follower.step(&target, sample, dt);
        self.last_output = Some(out);

        if self.within_tolerance(sample) {
            self.settled += 1;
        } else {
            self.settled = 0;
        }
        out
    }

    fn within_tolerance(&self, sample: &TelemetrySample) -> bool {
        if !self.generator.is_exhausted() {
            return false;
        }
        let goal = self.generator.final_setpoint();
        let yaw_ok = goal
            .yaw
            .map(|yaw| heading_error_deg(sample.yaw_deg(), yaw).abs() <= self.yaw_tolerance)
            .unwrap_or(true);
        goal.position.distance(sample.position) < self.tolerance && yaw_ok
    }

    /// Goal held within tolerance for the whole debounce window.
    pub fn reached(&self) -> bool {
        self.settled >= self.debounce_ticks
    }

    pub fn goal(&self) -> PositionSetpoint {
        self.generator.final_setpoint()
    }

    /// Distance from the vehicle to the goal.
    pub fn error(&self, sample: &TelemetrySample) -> f64 {
        self.goal().position.distance(sample.position)
    }

    /// Safe setpoint to hold when the session is abandoned: the last commanded
    /// position without feed-forward, or the vehicle's position for velocity output.
    pub fn hold_setpoint(&self, sample: &TelemetrySample) -> PositionSetpoint {
        match self.last_output {
            Some(ControlOutput::Position(sp)) => sp.hold(),
            _ => PositionSetpoint::at(sample.position, Some(sample.yaw_deg())),
        }
    }

    /// Picks the command up again after a pause held the vehicle at `sample`.
    pub fn resume(&mut self, sample: &TelemetrySample) {
        self.generator.resume_from(sample.position);
        self.follower.reset(sample);
        self.settled = 0;
    }

    /// Replaces the remaining waypoints and restarts the reached detection.
    pub fn update_waypoints(&mut self, waypoints: Vec<Vec3>, position: Vec3) {
        self.generator.replace_waypoints(waypoints, position, self.limits);
        self.settled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FollowerKind, NavConfig};

    fn session(target: Vec3, yaw: Option<f64>, debounce: u32) -> NavigationSession {
        let limits = KinematicLimits::default();
        NavigationSession::new(
            PathGenerator::direct(target, yaw),
            PathFollower::new(&NavConfig::default(), limits),
            limits,
            0.25,
            5.0,
            debounce,
        )
    }

    fn at(p: Vec3, yaw: f64) -> TelemetrySample {
        let mut s = TelemetrySample { position: p, ..TelemetrySample::default() };
        s.attitude.yaw = yaw;
        s
    }

    #[test]
    fn reached_needs_the_full_debounce_window() {
        let goal = Vec3::new(10.0, 0.0, -2.0);
        let mut s = session(goal, Some(-90.0), 3);

        s.tick(&at(Vec3::ZERO, -90.0), 0.05);
        assert!(!s.reached());

        let near = at(Vec3::new(9.9, 0.0, -2.0), -88.0);
        s.tick(&near, 0.05);
        s.tick(&near, 0.05);
        assert!(!s.reached());
        // noise spike resets the window
        s.tick(&at(Vec3::new(9.5, 0.0, -2.0), -88.0), 0.05);
        for _ in 0..2 {
            s.tick(&near, 0.05);
        }
        assert!(!s.reached());
        s.tick(&near, 0.05);
        assert!(s.reached());
    }

    #[test]
    fn heading_must_match() {
        let mut s = session(Vec3::ZERO, Some(90.0), 1);
        s.tick(&at(Vec3::ZERO, 60.0), 0.05);
        assert!(!s.reached());
        s.tick(&at(Vec3::ZERO, 93.0), 0.05);
        assert!(s.reached());
    }

    #[test]
    fn hold_uses_last_commanded_position() {
        let mut s = session(Vec3::new(3.0, 0.0, -1.0), None, 1);
        let sample = at(Vec3::ZERO, 0.0);
        assert_eq!(s.hold_setpoint(&sample).position, Vec3::ZERO);
        s.tick(&sample, 0.05);
        assert_eq!(s.hold_setpoint(&sample), PositionSetpoint::at(Vec3::new(3.0, 0.0, -1.0), None));
    }

    #[test]
    fn waypoint_update_moves_the_goal() {
        let mut s = session(Vec3::new(3.0, 0.0, -1.0), None, 1);
        let sample = at(Vec3::new(3.0, 0.0, -1.0), 0.0);
        s.tick(&sample, 0.05);
        assert!(s.reached());

        s.update_waypoints(vec![Vec3::new(3.0, 4.0, -1.0), Vec3::new(0.0, 4.0, -1.0)], sample.position);
        assert!(!s.reached());
        assert_eq!(s.goal().position, Vec3::new(0.0, 4.0, -1.0));
        s.tick(&sample, 0.05);
        assert!(!s.reached());
    }

    #[test]
    fn resume_continues_from_the_held_position() {
        let limits = KinematicLimits::default();
        let cfg = NavConfig { follower: FollowerKind::JerkLimited, ..NavConfig::default() };
        let mut s = NavigationSession::new(
            PathGenerator::direct(Vec3::new(10.0, 0.0, -2.0), None),
            PathFollower::new(&cfg, limits),
            limits,
            0.25,
            5.0,
            1,
        );
        let start = at(Vec3::new(0.0, 0.0, -2.0), 0.0);
        for _ in 0..40 {
            s.tick(&start, 0.05);
        }

        let held = at(Vec3::new(1.0, 0.5, -2.0), 0.0);
        s.resume(&held);
        match s.tick(&held, 0.05) {
            ControlOutput::Position(sp) => assert!(sp.position.distance(held.position) < 0.01, "jumped to {}", sp.position),
            other => panic!("unexpected {:?}", other),
        }
    }
}
