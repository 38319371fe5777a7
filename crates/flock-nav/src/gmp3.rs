//! Multi-waypoint minimum-jerk trajectory.
//!
//! Each segment between consecutive waypoints is a quintic per axis with
//! matched position, velocity and acceleration at both ends, which is the
//! minimum-jerk interpolant for those boundary conditions. Segment durations
//! start at the rest-to-rest lower bound and are stretched until sampled
//! velocity, acceleration and jerk respect the limits on every axis.
//! Via velocities are capped by what the neighbouring segments can reach and
//! shrunk further until no segment backs up or overshoots between its two
//! waypoints.

use flock_proto::{PositionSetpoint, Vec3};
use tracing::debug;

use crate::KinematicLimits;

const STRETCH: f64 = 1.15;
const MAX_STRETCH_ITERATIONS: usize = 60;
const LIMIT_SAMPLES: usize = 24;
const MIN_SEGMENT_TIME: f64 = 0.1;
/// Fraction of the velocity limit used at via points.
const CRUISE_FRACTION: f64 = 0.5;
/// Replans allowed for shrinking via velocities; the last one zeroes them.
const VIA_ROUNDS: usize = 8;
/// Slack when checking that a segment stays between its waypoints, meters.
const SPAN_TOLERANCE: f64 = 1e-3;

/// Kinematic state on the trajectory at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryState {
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    pub jerk: Vec3,
}

#[derive(Debug, Clone, PartialEq)]
struct Segment {
    t0: f64,
    duration: f64,
    coeffs: [[f64; 6]; 3],
}

impl Segment {
    fn plan(t0: f64, from: &TrajectoryState, to_pos: Vec3, to_vel: Vec3, limits: &KinematicLimits) -> Self {
        let mut duration = MIN_SEGMENT_TIME;
        for axis in 0..3 {
            let d = (to_pos[axis] - from.position[axis]).abs();
            let l = limits.axis(axis);
            let bound = (1.875 * d / l.velocity)
                .max((5.7735 * d / l.acceleration).sqrt())
                .max((60.0 * d / l.jerk).cbrt());
            duration = duration.max(bound);
        }

        let mut seg = Self::solve(t0, duration, from, to_pos, to_vel);
        for _ in 0..MAX_STRETCH_ITERATIONS {
            if seg.within(limits) {
                break;
            }
            seg = Self::solve(t0, seg.duration * STRETCH, from, to_pos, to_vel);
        }
        seg
    }

    fn solve(t0: f64, t: f64, from: &TrajectoryState, p1: Vec3, v1: Vec3) -> Self {
        let mut coeffs = [[0.0; 6]; 3];
        for (axis, c) in coeffs.iter_mut().enumerate() {
            let (p0, v0, a0) = (from.position[axis], from.velocity[axis], from.acceleration[axis]);
            let (v1, a1) = (v1[axis], 0.0);
            let h = p1[axis] - p0;
            let (t2, t3) = (t * t, t * t * t);
            c[0] = p0;
            c[1] = v0;
            c[2] = a0 / 2.0;
            c[3] = (20.0 * h - (8.0 * v1 + 12.0 * v0) * t - (3.0 * a0 - a1) * t2) / (2.0 * t3);
            c[4] = (-30.0 * h + (14.0 * v1 + 16.0 * v0) * t + (3.0 * a0 - 2.0 * a1) * t2) / (2.0 * t3 * t);
            c[5] = (12.0 * h - 6.0 * (v1 + v0) * t + (a1 - a0) * t2) / (2.0 * t3 * t2);
        }
        Self { t0, duration: t, coeffs }
    }

    fn within(&self, limits: &KinematicLimits) -> bool {
        (0..=LIMIT_SAMPLES).all(|k| {
            let s = self.sample_local(self.duration * k as f64 / LIMIT_SAMPLES as f64);
            (0..3).all(|axis| {
                let l = limits.axis(axis);
                s.velocity[axis].abs() <= l.velocity * (1.0 + 1e-6)
                    && s.acceleration[axis].abs() <= l.acceleration * (1.0 + 1e-6)
                    && s.jerk[axis].abs() <= l.jerk * (1.0 + 1e-6)
            })
        })
    }

    /// Whether `axis` stays between `a` and `b` over the whole segment.
    fn stays_between(&self, axis: usize, a: f64, b: f64) -> bool {
        let (lo, hi) = (a.min(b) - SPAN_TOLERANCE, a.max(b) + SPAN_TOLERANCE);
        (0..=2 * LIMIT_SAMPLES).all(|k| {
            let p = self.sample_local(self.duration * k as f64 / (2 * LIMIT_SAMPLES) as f64).position[axis];
            (lo..=hi).contains(&p)
        })
    }

    fn end(&self) -> f64 {
        self.t0 + self.duration
    }

    fn sample_local(&self, t: f64) -> TrajectoryState {
        let mut s = TrajectoryState {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            acceleration: Vec3::ZERO,
            jerk: Vec3::ZERO,
        };
        for (axis, c) in self.coeffs.iter().enumerate() {
            s.position[axis] = c[0] + t * (c[1] + t * (c[2] + t * (c[3] + t * (c[4] + t * c[5]))));
            s.velocity[axis] = c[1] + t * (2.0 * c[2] + t * (3.0 * c[3] + t * (4.0 * c[4] + t * 5.0 * c[5])));
            s.acceleration[axis] = 2.0 * c[2] + t * (6.0 * c[3] + t * (12.0 * c[4] + t * 20.0 * c[5]));
            s.jerk[axis] = 6.0 * c[3] + t * (24.0 * c[4] + t * 60.0 * c[5]);
        }
        s
    }
}

#[derive(Debug, Clone)]
pub struct Gmp3Generator {
    /// Flown (possibly truncated) segments followed by the planned ones.
    segments: Vec<Segment>,
    waypoints: Vec<Vec3>,
    limits: KinematicLimits,
    yaw: Option<f64>,
    t: f64,
    finished: bool,
}

impl Gmp3Generator {
    /// Plans from `start` (at rest) through every waypoint, stopping at the last.
    pub fn new(start: Vec3, waypoints: Vec<Vec3>, yaw: Option<f64>, limits: KinematicLimits) -> Self {
        let from = TrajectoryState {
            position: start,
            velocity: Vec3::ZERO,
            acceleration: Vec3::ZERO,
            jerk: Vec3::ZERO,
        };
        let segments = plan(0.0, &from, &waypoints, &limits);
        Self { segments, waypoints, limits, yaw, t: 0.0, finished: false }
    }

    pub fn duration(&self) -> f64 {
        self.segments.last().map(Segment::end).unwrap_or(0.0)
    }

    pub fn elapsed(&self) -> f64 {
        self.t
    }

    pub fn waypoints(&self) -> &[Vec3] {
        &self.waypoints
    }

    /// State at absolute trajectory time `t`, clamped to the trajectory.
    pub fn sample(&self, t: f64) -> Option<TrajectoryState> {
        let last = self.segments.last()?;
        let seg = self
            .segments
            .iter()
            .find(|s| t < s.end())
            .unwrap_or(last);
        Some(seg.sample_local((t - seg.t0).clamp(0.0, seg.duration)))
    }

    pub fn next_setpoint(&mut self, dt: f64) -> Option<PositionSetpoint> {
        if self.finished {
            return None;
        }
        self.t += dt;
        if self.t >= self.duration() {
            self.finished = true;
            return Some(self.final_setpoint());
        }
        let s = self.sample(self.t)?;
        Some(PositionSetpoint {
            position: s.position,
            velocity: Some(s.velocity),
            acceleration: Some(s.acceleration),
            yaw: self.yaw,
        })
    }

    pub fn final_setpoint(&self) -> PositionSetpoint {
        let end = self.waypoints.last().copied().unwrap_or(Vec3::ZERO);
        PositionSetpoint { position: end, velocity: Some(Vec3::ZERO), acceleration: Some(Vec3::ZERO), yaw: self.yaw }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Replans the waypoints not yet passed from `position` at rest, for a
    /// vehicle that was stopped somewhere along the way.
    pub fn resume_from(&mut self, position: Vec3) {
        if self.finished {
            return;
        }
        let t = self.t;
        let first = self.segments.len().saturating_sub(self.waypoints.len());
        let remaining: Vec<Vec3> = self.segments[first..]
            .iter()
            .zip(&self.waypoints)
            .filter(|(s, _)| s.end() > t)
            .map(|(_, wp)| *wp)
            .collect();
        if remaining.is_empty() {
            return;
        }
        let rest = TrajectoryState { position, velocity: Vec3::ZERO, acceleration: Vec3::ZERO, jerk: Vec3::ZERO };
        self.segments.retain(|s| s.end() <= t);
        self.segments.extend(plan(t, &rest, &remaining, &self.limits));
        self.waypoints = remaining;
    }

    pub fn restart(&mut self) {
        self.t = 0.0;
        self.finished = false;
    }

    /// Replaces the waypoints not yet reached. Everything before the current
    /// time stays as flown; the rest is replanned from the current state.
    pub fn replace_waypoints(&mut self, waypoints: Vec<Vec3>) {
        let Some(now) = self.sample(self.t) else { return };
        let t = self.t.min(self.duration());

        self.segments.retain(|s| s.t0 < t);
        if let Some(cur) = self.segments.last_mut() {
            cur.duration = cur.duration.min(t - cur.t0);
        }
        let replanned = plan(t, &now, &waypoints, &self.limits);
        debug!(
            "gmp3: replanned {} waypoints at t={:.2}s, {:.2}s remaining",
            waypoints.len(),
            t,
            replanned.last().map(|s| s.end() - t).unwrap_or(0.0)
        );
        self.segments.extend(replanned);
        self.waypoints = waypoints;
        self.finished = false;
    }
}

fn plan(t0: f64, from: &TrajectoryState, waypoints: &[Vec3], limits: &KinematicLimits) -> Vec<Segment> {
    let mut vias: Vec<Vec3> = waypoints
        .iter()
        .enumerate()
        .map(|(i, wp)| match waypoints.get(i + 1) {
            Some(next) => {
                let prev = if i == 0 { from.position } else { waypoints[i - 1] };
                via_velocity(prev, *wp, *next, limits)
            }
            None => Vec3::ZERO,
        })
        .collect();

    for round in 1..=VIA_ROUNDS {
        let segments = plan_through(t0, from, waypoints, &vias, limits);
        let factor = if round == VIA_ROUNDS { 0.0 } else { 0.5 };
        let mut settled = true;
        for (i, seg) in segments.iter().enumerate() {
            let start = if i == 0 { from.position } else { waypoints[i - 1] };
            for axis in 0..3 {
                if seg.stays_between(axis, start[axis], waypoints[i][axis]) {
                    continue;
                }
                settled = false;
                // the vias bounding this segment; the initial state is not ours to change
                if i > 0 {
                    vias[i - 1][axis] *= factor;
                }
                vias[i][axis] *= factor;
            }
        }
        if settled {
            return segments;
        }
    }
    plan_through(t0, from, waypoints, &vias, limits)
}

fn plan_through(t0: f64, from: &TrajectoryState, waypoints: &[Vec3], vias: &[Vec3], limits: &KinematicLimits) -> Vec<Segment> {
    let mut segments = Vec::with_capacity(waypoints.len());
    let mut state = *from;
    let mut t = t0;
    for (wp, via) in waypoints.iter().zip(vias) {
        let seg = Segment::plan(t, &state, *wp, *via, limits);
        t = seg.end();
        state = seg.sample_local(seg.duration);
        // pin the boundary exactly, the polynomial evaluation drifts by rounding
        state.position = *wp;
        state.velocity = *via;
        state.acceleration = Vec3::ZERO;
        segments.push(seg);
    }
    segments
}

/// Pass-through velocity at `at`: the mean travel direction times a cruise
/// speed, or a stop when the path turns by more than 90 degrees.
///
/// Per axis the speed is also capped by what the shorter neighbouring leg
/// can reach from rest, and is zero where the path reverses on that axis.
fn via_velocity(prev: Vec3, at: Vec3, next: Vec3, limits: &KinematicLimits) -> Vec3 {
    let (d_in, d_out) = (at - prev, next - at);
    let (u_in, u_out) = (d_in.normalized(), d_out.normalized());
    if u_in.dot(u_out) <= 0.0 {
        return Vec3::ZERO;
    }
    let dir = (u_in + u_out) * 0.5;
    let mut v = Vec3::ZERO;
    for axis in 0..3 {
        if d_in[axis] * d_out[axis] <= 0.0 {
            continue;
        }
        let l = limits.axis(axis);
        let d = d_in[axis].abs().min(d_out[axis].abs());
        let reachable = (l.acceleration * d).sqrt().min((l.jerk * d * d).cbrt());
        v[axis] = dir[axis] * (l.velocity * CRUISE_FRACTION).min(reachable);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<Vec3> {
        vec![
            Vec3::new(10.0, 0.0, -2.0),
            Vec3::new(10.0, 10.0, -2.0),
            Vec3::new(0.0, 10.0, -2.0),
        ]
    }

    #[test]
    fn passes_through_every_waypoint() {
        let g = Gmp3Generator::new(Vec3::new(0.0, 0.0, -2.0), square(), None, KinematicLimits::default());
        let mut t = 0.0;
        for (seg, wp) in g.segments.iter().zip(square()) {
            t += seg.duration;
            let s = g.sample(t - 1e-9).unwrap();
            assert!(s.position.distance(wp) < 1e-3, "{} vs {}", s.position, wp);
        }
        assert!((t - g.duration()).abs() < 1e-9);
    }

    #[test]
    fn respects_limits() {
        let limits = KinematicLimits::default();
        let g = Gmp3Generator::new(Vec3::new(0.0, 0.0, -1.0), vec![Vec3::new(8.0, 3.0, -5.0), Vec3::new(12.0, 9.0, -3.0)], None, limits);
        let mut t = 0.0;
        while t <= g.duration() {
            let s = g.sample(t).unwrap();
            for axis in 0..3 {
                let l = limits.axis(axis);
                assert!(s.velocity[axis].abs() <= l.velocity * 1.05);
                assert!(s.acceleration[axis].abs() <= l.acceleration * 1.05);
                assert!(s.jerk[axis].abs() <= l.jerk * 1.05);
            }
            t += 0.01;
        }
    }

    fn assert_inside_bounding_box(start: Vec3, waypoints: &[Vec3]) {
        let (mut lo, mut hi) = (start, start);
        for wp in waypoints {
            for axis in 0..3 {
                lo[axis] = lo[axis].min(wp[axis]);
                hi[axis] = hi[axis].max(wp[axis]);
            }
        }
        let mut g = Gmp3Generator::new(start, waypoints.to_vec(), None, KinematicLimits::default());
        while let Some(sp) = g.next_setpoint(0.02) {
            for axis in 0..3 {
                assert!(
                    sp.position[axis] >= lo[axis] - 0.05 && sp.position[axis] <= hi[axis] + 0.05,
                    "{} outside [{}, {}] at t={:.2}",
                    sp.position,
                    lo,
                    hi,
                    g.elapsed()
                );
            }
        }
    }

    #[test]
    fn short_leg_does_not_back_up() {
        assert_inside_bounding_box(Vec3::ZERO, &[Vec3::new(1.0, 0.0, 0.0), Vec3::new(40.0, 0.0, 0.0)]);
    }

    #[test]
    fn mixed_legs_stay_inside_the_waypoint_box() {
        assert_inside_bounding_box(
            Vec3::new(0.0, 0.0, -2.0),
            &[
                Vec3::new(0.5, 0.0, -2.0),
                Vec3::new(12.0, 0.3, -2.5),
                Vec3::new(12.4, 6.0, -2.5),
                Vec3::new(20.0, 6.2, -4.0),
                Vec3::new(20.1, 6.2, -4.0),
            ],
        );
        assert_inside_bounding_box(Vec3::ZERO, &[Vec3::new(2.0, 2.0, -0.2), Vec3::new(30.0, 25.0, -1.0)]);
    }

    #[test]
    fn via_speed_is_capped_by_the_short_leg() {
        let limits = KinematicLimits::default();
        let v = via_velocity(Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0), Vec3::new(40.0, 0.0, 0.0), &limits);
        assert!(v.x > 0.0 && v.x <= 1.0 + 1e-9, "{v}");
        assert_eq!(v.y, 0.0);

        // reversing on y while continuing on x
        let v = via_velocity(Vec3::ZERO, Vec3::new(10.0, 2.0, 0.0), Vec3::new(20.0, 0.0, 0.0), &limits);
        assert!(v.x > 0.0);
        assert_eq!(v.y, 0.0);
    }

    #[test]
    fn emits_until_final_setpoint() {
        let mut g = Gmp3Generator::new(Vec3::ZERO, vec![Vec3::new(2.0, 0.0, 0.0)], Some(45.0), KinematicLimits::default());
        let mut last = None;
        let mut n = 0;
        while let Some(sp) = g.next_setpoint(0.05) {
            last = Some(sp);
            n += 1;
        }
        assert!(g.is_finished());
        assert!(n as f64 >= g.duration() / 0.05);
        let last = last.unwrap();
        assert_eq!(last.position, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(last.yaw, Some(45.0));

        g.restart();
        assert!(g.next_setpoint(0.05).is_some());
    }

    #[test]
    fn replanning_keeps_the_flown_part() {
        let mut g = Gmp3Generator::new(Vec3::new(0.0, 0.0, -2.0), square(), None, KinematicLimits::default());
        let before: Vec<_> = (0..100).map(|k| g.sample(k as f64 * 0.05).unwrap()).collect();
        for _ in 0..100 {
            g.next_setpoint(0.05);
        }
        let now = g.sample(g.elapsed()).unwrap();

        let new_wps = vec![Vec3::new(5.0, -5.0, -3.0)];
        g.replace_waypoints(new_wps.clone());

        for (k, old) in before.iter().enumerate().take(99) {
            let s = g.sample(k as f64 * 0.05).unwrap();
            assert!(s.position.distance(old.position) < 1e-9, "history changed at step {}", k);
        }
        // continuous at the splice point
        let spliced = g.sample(g.elapsed() + 1e-9).unwrap();
        assert!(spliced.position.distance(now.position) < 1e-6);
        assert!(spliced.velocity.distance(now.velocity) < 1e-6);

        assert_eq!(g.waypoints(), &new_wps[..]);
        let end = g.sample(g.duration()).unwrap();
        assert!(end.position.distance(new_wps[0]) < 1e-6);
    }

    #[test]
    fn resume_replans_from_the_held_position() {
        let mut g = Gmp3Generator::new(Vec3::new(0.0, 0.0, -2.0), square(), None, KinematicLimits::default());
        for _ in 0..20 {
            g.next_setpoint(0.05);
        }
        let held = Vec3::new(0.5, 0.3, -2.0);
        g.resume_from(held);
        assert_eq!(g.waypoints().len(), 3);
        let first = g.next_setpoint(0.05).unwrap();
        assert!(first.position.distance(held) < 0.01, "jumped to {}", first.position);

        let flown: Vec<_> = std::iter::from_fn(|| g.next_setpoint(0.05)).take(100_000).collect();
        let corner = Vec3::new(10.0, 0.0, -2.0);
        assert!(flown.iter().any(|sp| sp.position.distance(corner) < 0.05));
        assert_eq!(flown.last().map(|sp| sp.position), Some(Vec3::new(0.0, 10.0, -2.0)));
    }

    #[test]
    fn resume_skips_passed_waypoints() {
        let mut g = Gmp3Generator::new(Vec3::new(0.0, 0.0, -2.0), square(), None, KinematicLimits::default());
        let first_leg = g.segments[0].end();
        while g.elapsed() < first_leg + 0.5 {
            g.next_setpoint(0.05);
        }
        g.resume_from(Vec3::new(10.2, 0.8, -2.0));
        assert_eq!(g.waypoints(), &square()[1..]);
        assert!(g.duration() > g.elapsed());
    }
}
