use flock_proto::{heading_error_deg, ControlOutput, PositionSetpoint, TelemetrySample, Vec3, VelocitySetpoint};

use crate::jerk::JerkLimitedFollower;
use crate::{FollowerKind, KinematicLimits, NavConfig};

/// Yaw-rate gain of the velocity follower, 1/s.
const YAW_GAIN: f64 = 1.0;
const MAX_YAW_RATE: f64 = 45.0;

/// Saturated proportional velocity control on position error.
#[derive(Debug, Clone)]
pub struct VelocityFollower {
    limits: KinematicLimits,
    gain: f64,
}

impl VelocityFollower {
    pub fn new(limits: KinematicLimits, gain: f64) -> Self {
        Self { limits, gain }
    }

    pub fn step(&self, target: &PositionSetpoint, sample: &TelemetrySample) -> VelocitySetpoint {
        let err = target.position - sample.position;
        let horizontal = Vec3::new(err.x, err.y, 0.0) * self.gain;
        let horizontal = horizontal.clamp_norm(self.limits.horizontal.velocity);
        let vz = (err.z * self.gain).clamp(-self.limits.vertical.velocity, self.limits.vertical.velocity);

        let yaw_rate = match target.yaw {
            Some(yaw) => (heading_error_deg(sample.yaw_deg(), yaw) * YAW_GAIN).clamp(-MAX_YAW_RATE, MAX_YAW_RATE),
            None => 0.0,
        };
        VelocitySetpoint { velocity: Vec3::new(horizontal.x, horizontal.y, vz), yaw_rate }
    }
}

/// Turns generator setpoints into what is transmitted each control tick.
#[derive(Debug, Clone)]
pub enum PathFollower {
    /// Forward unchanged, the flight controller does the smoothing.
    Direct,
    JerkLimited(JerkLimitedFollower),
    Velocity(VelocityFollower),
}

impl PathFollower {
    pub fn new(cfg: &NavConfig, limits: KinematicLimits) -> Self {
        match cfg.follower {
            FollowerKind::Direct => PathFollower::Direct,
            FollowerKind::JerkLimited => PathFollower::JerkLimited(JerkLimitedFollower::new(limits)),
            FollowerKind::Velocity => PathFollower::Velocity(VelocityFollower::new(limits, cfg.velocity_gain)),
        }
    }

    /// Forgets internal state, the next step starts from `sample`.
    pub fn reset(&mut self, sample: &TelemetrySample) {
        if let PathFollower::JerkLimited(f) = self {
            f.reset(sample);
        }
    }

    pub fn step(&mut self, target: &PositionSetpoint, sample: &TelemetrySample, dt: f64) -> ControlOutput {
        match self {
            PathFollower::Direct => ControlOutput::Position(*target),
            PathFollower::JerkLimited(f) => ControlOutput::Position(f.step(target, sample, dt)),
            PathFollower::Velocity(f) => ControlOutput::Velocity(f.step(target, sample)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_forwards_unchanged() {
        let mut f = PathFollower::new(&NavConfig::default(), KinematicLimits::default());
        let sp = PositionSetpoint::at(Vec3::new(1.0, 2.0, -3.0), Some(30.0));
        assert_eq!(f.step(&sp, &TelemetrySample::default(), 0.05), ControlOutput::Position(sp));
    }

    #[test]
    fn velocity_follower_saturates() {
        let cfg = NavConfig { follower: FollowerKind::Velocity, ..NavConfig::default() };
        let mut f = PathFollower::new(&cfg, KinematicLimits::default());
        let sp = PositionSetpoint::at(Vec3::new(100.0, 0.0, -20.0), Some(90.0));
        match f.step(&sp, &TelemetrySample::default(), 0.05) {
            ControlOutput::Velocity(v) => {
                assert!((v.velocity.x - 10.0).abs() < 1e-9);
                assert_eq!(v.velocity.z, -1.0);
                assert_eq!(v.yaw_rate, MAX_YAW_RATE);
            }
            other => panic!("unexpected output {:?}", other),
        }

        let near = PositionSetpoint::at(Vec3::new(0.2, -0.1, 0.0), None);
        match f.step(&near, &TelemetrySample::default(), 0.05) {
            ControlOutput::Velocity(v) => {
                assert!(v.velocity.distance(Vec3::new(0.2, -0.1, 0.0)) < 1e-9);
                assert_eq!(v.yaw_rate, 0.0);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }
}
