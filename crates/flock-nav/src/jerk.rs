use flock_proto::{PositionSetpoint, TelemetrySample, Vec3};

use crate::{AxisLimits, KinematicLimits};

/// Coarse samples between the rest velocity and the velocity bound when
/// looking for the cruise velocity that lands on the target.
const SCAN_STEPS: usize = 32;
const BISECTIONS: usize = 60;

/// A stretch of constant jerk.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Phase {
    jerk: f64,
    duration: f64,
}

impl Phase {
    fn new(jerk: f64, duration: f64) -> Self {
        Self { jerk, duration }
    }
}

/// Two velocity changes around a cruise: `(v, a) -> (peak, 0) -> cruise -> (target_v, 0)`.
type Profile = [Phase; 7];

/// Shortest maneuver that takes `(v0, a0)` to `v1` with zero acceleration.
///
/// The acceleration ramps toward a peak at the jerk bound, holds at the
/// acceleration bound if the change is large enough, and ramps back to zero.
fn velocity_change(v0: f64, a0: f64, v1: f64, l: &AxisLimits) -> [Phase; 3] {
    let (jerk, a_max) = (l.jerk, l.acceleration);
    // velocity reached by just ramping the current acceleration out
    let rest = v0 + a0 * a0.abs() / (2.0 * jerk);
    if (v1 - rest).abs() < 1e-12 {
        return [Phase::new(-a0.signum() * jerk, a0.abs() / jerk), Phase::default(), Phase::default()];
    }

    let s = (v1 - rest).signum();
    let a0s = s * a0;
    let dv = s * (v1 - v0);
    let mut peak = (jerk * dv + a0s * a0s / 2.0).max(0.0).sqrt();
    let mut hold = 0.0;
    if peak > a_max {
        peak = a_max;
        hold = ((dv - (2.0 * a_max * a_max - a0s * a0s) / (2.0 * jerk)) / a_max).max(0.0);
    }
    [
        Phase::new(s * jerk, ((peak - a0s) / jerk).max(0.0)),
        Phase::new(0.0, hold),
        Phase::new(-s * jerk, peak / jerk),
    ]
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct AxisState {
    p: f64,
    v: f64,
    a: f64,
}

impl AxisState {
    fn integrate(self, jerk: f64, t: f64) -> Self {
        Self {
            p: self.p + self.v * t + self.a * t * t / 2.0 + jerk * t * t * t / 6.0,
            v: self.v + self.a * t + jerk * t * t / 2.0,
            a: self.a + jerk * t,
        }
    }

    /// End state and total duration of `phases` started from here.
    fn run(self, phases: &[Phase]) -> (Self, f64) {
        phases.iter().fold((self, 0.0), |(state, t), phase| {
            (state.integrate(phase.jerk, phase.duration), t + phase.duration)
        })
    }

    /// Plans from the current state to `target`, which moves at `target_v`.
    ///
    /// The profile ends exactly on the target with its velocity and zero
    /// acceleration. Among the peak velocities that achieve that, the one
    /// nearest the rest velocity is taken so a target at rest is approached
    /// from one side only and consecutive replans agree.
    fn plan(&self, target: f64, target_v: f64, l: &AxisLimits) -> Profile {
        let target_v = target_v.clamp(-l.velocity, l.velocity);
        let profile = |peak: f64, cruise: f64| -> Profile {
            let [a, b, c] = velocity_change(self.v, self.a, peak, l);
            let [d, e, f] = velocity_change(peak, 0.0, target_v, l);
            [a, b, c, Phase::new(0.0, cruise), d, e, f]
        };
        // signed distance past the target when the profile ends, no cruise
        let miss = |peak: f64| {
            let (end, t) = self.run(&profile(peak, 0.0));
            end.p - target - target_v * t
        };

        let rest = (self.v + self.a * self.a.abs() / (2.0 * l.jerk)).clamp(-l.velocity, l.velocity);
        let mut lo = rest;
        let mut lo_miss = miss(rest);
        let edge = if lo_miss <= 0.0 { l.velocity } else { -l.velocity };
        let edge_miss = miss(edge);
        if edge_miss * edge < 0.0 {
            // even the bound falls short: cruise at it
            let closing = edge - target_v;
            let cruise = if closing.abs() > 1e-9 { -edge_miss / closing } else { 0.0 };
            return profile(edge, cruise);
        }

        let mut hi = edge;
        for i in 1..=SCAN_STEPS {
            let x = rest + (edge - rest) * i as f64 / SCAN_STEPS as f64;
            let x_miss = miss(x);
            if (x_miss > 0.0) != (lo_miss > 0.0) {
                hi = x;
                break;
            }
            lo = x;
            lo_miss = x_miss;
        }
        for _ in 0..BISECTIONS {
            let mid = (lo + hi) / 2.0;
            let mid_miss = miss(mid);
            if (mid_miss > 0.0) == (lo_miss > 0.0) {
                lo = mid;
                lo_miss = mid_miss;
            } else {
                hi = mid;
            }
        }
        profile((lo + hi) / 2.0, 0.0)
    }

    /// Follows `phases` for `dt`, coasting at constant acceleration past their end.
    fn advance(&mut self, phases: &[Phase], dt: f64) {
        let mut left = dt;
        for phase in phases {
            if left <= 0.0 {
                break;
            }
            let t = phase.duration.min(left);
            *self = self.integrate(phase.jerk, t);
            left -= t;
        }
        if left > 0.0 {
            *self = self.integrate(0.0, left);
        }
    }

    fn step(&mut self, target: f64, target_v: f64, l: &AxisLimits, dt: f64) {
        let profile = self.plan(target, target_v, l);
        self.advance(&profile, dt);
    }
}

/// Tracks the generator setpoint with its own position/velocity/acceleration
/// state so the transmitted setpoints never exceed the configured bounds.
///
/// Every tick plans a time-optimal jerk-limited profile per axis from the
/// current state and takes one step along it. A target at rest is reached
/// without overshoot. The state starts from the vehicle's telemetry and is
/// replanned from wherever it is when the target jumps, never from rest.
#[derive(Debug, Clone)]
pub struct JerkLimitedFollower {
    limits: KinematicLimits,
    axes: [AxisState; 3],
    initialized: bool,
}

impl JerkLimitedFollower {
    pub fn new(limits: KinematicLimits) -> Self {
        Self { limits, axes: [AxisState::default(); 3], initialized: false }
    }

    /// Seeds the internal state from telemetry, acceleration zero.
    pub fn reset(&mut self, sample: &TelemetrySample) {
        for i in 0..3 {
            self.axes[i] = AxisState { p: sample.position[i], v: sample.velocity[i], a: 0.0 };
        }
        self.initialized = true;
    }

    pub fn step(&mut self, target: &PositionSetpoint, sample: &TelemetrySample, dt: f64) -> PositionSetpoint {
        if !self.initialized {
            self.reset(sample);
        }
        let target_v = target.velocity.unwrap_or(Vec3::ZERO);
        for (i, axis) in self.axes.iter_mut().enumerate() {
            axis.step(target.position[i], target_v[i], &self.limits.axis(i), dt);
        }
        PositionSetpoint {
            position: self.position(),
            velocity: Some(Vec3::new(self.axes[0].v, self.axes[1].v, self.axes[2].v)),
            acceleration: Some(Vec3::new(self.axes[0].a, self.axes[1].a, self.axes[2].a)),
            yaw: target.yaw,
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(self.axes[0].p, self.axes[1].p, self.axes[2].p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RectLocalFence;

    const DT: f64 = 0.05;

    fn at(p: Vec3) -> TelemetrySample {
        TelemetrySample { position: p, ..TelemetrySample::default() }
    }

    /// Runs `ticks` steps and checks velocity, acceleration and jerk bounds on every one.
    fn run_checked(f: &mut JerkLimitedFollower, target: &PositionSetpoint, ticks: usize, prev_a: &mut Vec3) -> PositionSetpoint {
        let limits = KinematicLimits::default();
        let mut out = *target;
        for _ in 0..ticks {
            out = f.step(target, &at(f.position()), DT);
            let a = out.acceleration.unwrap();
            let v = out.velocity.unwrap();
            for i in 0..3 {
                let l = limits.axis(i);
                assert!(a[i].abs() <= l.acceleration + 1e-9, "accel {} on axis {}", a[i], i);
                assert!(((a[i] - prev_a[i]) / DT).abs() <= l.jerk + 1e-6, "jerk on axis {}", i);
                assert!(v[i].abs() <= l.velocity + 1e-6, "velocity {} on axis {}", v[i], i);
            }
            *prev_a = a;
        }
        out
    }

    #[test]
    fn step_input_respects_bounds_and_converges() {
        let mut f = JerkLimitedFollower::new(KinematicLimits::default());
        f.reset(&at(Vec3::new(0.0, 0.0, -2.0)));
        let target = PositionSetpoint::at(Vec3::new(10.0, -4.0, -5.0), None);
        let mut prev_a = Vec3::ZERO;
        let out = run_checked(&mut f, &target, 1200, &mut prev_a);
        assert!(out.position.distance(target.position) < 0.05, "ended at {}", out.position);
    }

    #[test]
    fn rest_target_is_reached_without_overshoot() {
        let mut f = JerkLimitedFollower::new(KinematicLimits::default());
        f.reset(&at(Vec3::ZERO));
        let target = PositionSetpoint::at(Vec3::new(10.0, 0.0, 0.0), None);
        let mut prev_a = Vec3::ZERO;
        let mut max_x = f64::MIN;
        // 7.5 s; the time-optimal profile for 10 m at the default limits takes 6.84 s
        for _ in 0..150 {
            let out = run_checked(&mut f, &target, 1, &mut prev_a);
            max_x = max_x.max(out.position.x);
        }
        assert!(max_x <= 10.0 + 1e-6, "overshot to {max_x}");
        assert!(f.position().distance(target.position) < 0.05, "ended at {}", f.position());
    }

    #[test]
    fn crossing_a_fence_interior_stays_inside() {
        let fence = RectLocalFence::new(Vec3::new(-5.0, -5.0, -10.0), Vec3::new(5.0, 5.0, 0.0), 0.0, 0.0).unwrap();
        let mut f = JerkLimitedFollower::new(KinematicLimits::default());
        f.reset(&at(Vec3::new(-4.5, 0.0, -2.0)));
        let target = PositionSetpoint::at(Vec3::new(4.5, 0.0, -2.0), None);
        let mut prev_a = Vec3::ZERO;
        for _ in 0..300 {
            let out = run_checked(&mut f, &target, 1, &mut prev_a);
            assert!(fence.contains(out.position), "left the fence at {}", out.position);
            assert!(out.position.x <= 4.5 + 1e-6);
        }
        assert!(f.position().distance(target.position) < 0.01);
    }

    #[test]
    fn abrupt_retarget_replans_from_current_state() {
        let mut f = JerkLimitedFollower::new(KinematicLimits::default());
        f.reset(&at(Vec3::ZERO));
        let mut prev_a = Vec3::ZERO;
        let first = run_checked(&mut f, &PositionSetpoint::at(Vec3::new(20.0, 0.0, 0.0), None), 100, &mut prev_a);
        assert!(first.velocity.unwrap().x > 0.5);

        // reverse: bounds still hold across the switch
        let back = PositionSetpoint::at(Vec3::new(-5.0, 0.0, 0.0), None);
        let out = run_checked(&mut f, &back, 1500, &mut prev_a);
        assert!(out.position.distance(back.position) < 0.05, "ended at {}", out.position);
    }

    #[test]
    fn velocity_change_lands_on_zero_acceleration() {
        let l = KinematicLimits::default().horizontal;
        for (v0, a0, v1) in [(0.0, 0.0, 8.0), (2.0, 1.5, -3.0), (-1.0, -2.0, 0.5), (1.0, 0.5, 1.125)] {
            let phases = velocity_change(v0, a0, v1, &l);
            let (end, _) = AxisState { p: 0.0, v: v0, a: a0 }.run(&phases);
            assert!((end.v - v1).abs() < 1e-9, "{v0} {a0} -> {}", end.v);
            assert!(end.a.abs() < 1e-9);
        }
    }

    #[test]
    fn initializes_from_telemetry() {
        let mut f = JerkLimitedFollower::new(KinematicLimits::default());
        let sample = at(Vec3::new(3.0, 4.0, -1.0));
        let out = f.step(&PositionSetpoint::at(Vec3::new(3.0, 4.0, -1.0), Some(10.0)), &sample, DT);
        assert_eq!(out.position, Vec3::new(3.0, 4.0, -1.0));
        assert_eq!(out.yaw, Some(10.0));
    }
}
