use flock_proto::{ControlOutput, PositionSetpoint, Vec3};
use serde::Deserialize;
use std::fmt;

const AXES: [&str; 3] = ["north", "east", "down"];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FenceError {
    #[error("fence {axis} bounds invalid: min {min} >= max {max}")]
    InvalidBounds { axis: &'static str, min: f64, max: f64 },

    #[error("fence {axis} span {span:.2} m leaves no room for a total margin of {margin:.2} m")]
    TooSmall { axis: &'static str, span: f64, margin: f64 },

    #[error("fence margins must be non-negative")]
    NegativeMargin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceMode {
    /// Refuse targets outside the fence, fail on violations while flying.
    #[default]
    Reject,
    /// Clamp every transmitted setpoint into the fence.
    Clip,
}

/// Fence section of the configuration, `[min, max]` per NED axis in meters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FenceConfig {
    pub north: [f64; 2],
    pub east: [f64; 2],
    pub down: [f64; 2],
    #[serde(default)]
    pub vehicle_size: f64,
    #[serde(default)]
    pub safety_margin: f64,
    #[serde(default)]
    pub mode: FenceMode,
}

/// Axis-aligned box in the local NED frame.
///
/// Setpoints must keep the vehicle `vehicle_size + safety_margin` away from
/// every face; the vehicle's own position is checked against the raw box.
#[derive(Debug, Clone, PartialEq)]
pub struct RectLocalFence {
    min: Vec3,
    max: Vec3,
    vehicle_size: f64,
    safety_margin: f64,
}

impl RectLocalFence {
    pub fn new(min: Vec3, max: Vec3, vehicle_size: f64, safety_margin: f64) -> Result<Self, FenceError> {
        if vehicle_size < 0.0 || safety_margin < 0.0 {
            return Err(FenceError::NegativeMargin);
        }
        let margin = vehicle_size + safety_margin;
        for (i, &axis) in AXES.iter().enumerate() {
            if !(min[i] < max[i]) {
                return Err(FenceError::InvalidBounds { axis, min: min[i], max: max[i] });
            }
            let span = max[i] - min[i];
            if span <= 2.0 * margin {
                return Err(FenceError::TooSmall { axis, span, margin });
            }
        }
        Ok(Self { min, max, vehicle_size, safety_margin })
    }

    fn margin(&self) -> f64 {
        self.vehicle_size + self.safety_margin
    }

    pub fn effective_min(&self) -> Vec3 {
        self.min.map(|v| v + self.margin())
    }

    pub fn effective_max(&self) -> Vec3 {
        self.max.map(|v| v - self.margin())
    }

    /// Inside the box shrunk by the margins.
    pub fn contains(&self, p: Vec3) -> bool {
        let (lo, hi) = (self.effective_min(), self.effective_max());
        (0..3).all(|i| p[i] >= lo[i] && p[i] <= hi[i])
    }

    /// Inside the configured bounds, margins ignored.
    pub fn contains_raw(&self, p: Vec3) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    /// Nearest point of the shrunk box.
    pub fn clamp(&self, p: Vec3) -> Vec3 {
        let (lo, hi) = (self.effective_min(), self.effective_max());
        Vec3::new(p.x.clamp(lo.x, hi.x), p.y.clamp(lo.y, hi.y), p.z.clamp(lo.z, hi.z))
    }
}

impl fmt::Display for RectLocalFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "N[{:.2},{:.2}] E[{:.2},{:.2}] D[{:.2},{:.2}] margin {:.2}",
            self.min.x, self.max.x, self.min.y, self.max.y, self.min.z, self.max.z, self.margin()
        )
    }
}

/// Outcome of passing one control output through the fence.
#[derive(Debug, Clone, PartialEq)]
pub enum FenceVerdict {
    Pass(ControlOutput),
    /// Clip mode moved the output back inside; `message` describes what changed.
    Clipped { output: ControlOutput, message: String },
    /// Reject mode refused the output.
    Violation(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FenceEngine {
    geometry: RectLocalFence,
    mode: FenceMode,
}

impl FenceEngine {
    pub fn new(geometry: RectLocalFence, mode: FenceMode) -> Self {
        Self { geometry, mode }
    }

    pub fn from_config(cfg: &FenceConfig) -> Result<Self, FenceError> {
        let min = Vec3::new(cfg.north[0], cfg.east[0], cfg.down[0]);
        let max = Vec3::new(cfg.north[1], cfg.east[1], cfg.down[1]);
        let geometry = RectLocalFence::new(min, max, cfg.vehicle_size, cfg.safety_margin)?;
        Ok(Self::new(geometry, cfg.mode))
    }

    pub fn mode(&self) -> FenceMode {
        self.mode
    }

    pub fn geometry(&self) -> &RectLocalFence {
        &self.geometry
    }

    /// Target check done when a command is accepted.
    pub fn check_target(&self, target: Vec3) -> Result<(), String> {
        if self.geometry.contains(target) {
            Ok(())
        } else {
            Err(format!("target {} outside fence {}", target, self.geometry))
        }
    }

    pub fn clamp(&self, p: Vec3) -> Vec3 {
        self.geometry.clamp(p)
    }

    /// Applies the enforcement mode to one tick's output. `position` is the
    /// vehicle's current position.
    pub fn apply(&self, output: ControlOutput, position: Vec3) -> FenceVerdict {
        match self.mode {
            FenceMode::Reject => {
                if !self.geometry.contains_raw(position) {
                    return FenceVerdict::Violation(format!("vehicle at {} outside fence {}", position, self.geometry));
                }
                match output {
                    ControlOutput::Position(sp) if !self.geometry.contains(sp.position) => {
                        FenceVerdict::Violation(format!("setpoint {} outside fence {}", sp.position, self.geometry))
                    }
                    ControlOutput::Velocity(sp) if self.limit_velocity(position, sp.velocity) != sp.velocity => {
                        FenceVerdict::Violation(format!("velocity {} leaves fence at {}", sp.velocity, position))
                    }
                    _ => FenceVerdict::Pass(output),
                }
            }
            FenceMode::Clip => match output {
                ControlOutput::Position(sp) => {
                    let clamped = self.geometry.clamp(sp.position);
                    if clamped == sp.position {
                        return FenceVerdict::Pass(output);
                    }
                    // feed-forward would push back out of the fence
                    let clipped = PositionSetpoint::at(clamped, sp.yaw);
                    FenceVerdict::Clipped {
                        output: ControlOutput::Position(clipped),
                        message: format!("setpoint {} clipped to {}", sp.position, clamped),
                    }
                }
                ControlOutput::Velocity(mut sp) => {
                    let limited = self.limit_velocity(position, sp.velocity);
                    if limited == sp.velocity {
                        return FenceVerdict::Pass(output);
                    }
                    let message = format!("velocity {} clipped to {} at {}", sp.velocity, limited, position);
                    sp.velocity = limited;
                    FenceVerdict::Clipped { output: ControlOutput::Velocity(sp), message }
                }
            },
        }
    }

    /// Zeroes velocity components pointing further out on faces already reached.
    fn limit_velocity(&self, position: Vec3, velocity: Vec3) -> Vec3 {
        let (lo, hi) = (self.geometry.effective_min(), self.geometry.effective_max());
        let mut v = velocity;
        for i in 0..3 {
            if (position[i] >= hi[i] && v[i] > 0.0) || (position[i] <= lo[i] && v[i] < 0.0) {
                v[i] = 0.0;
            }
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_proto::VelocitySetpoint;

    fn fence(mode: FenceMode) -> FenceEngine {
        let cfg = FenceConfig {
            north: [-5.0, 5.0],
            east: [-5.0, 5.0],
            down: [-10.0, 0.0],
            vehicle_size: 0.0,
            safety_margin: 0.0,
            mode,
        };
        FenceEngine::from_config(&cfg).unwrap()
    }

    #[test]
    fn reject_mode_refuses_outside_target() {
        let f = fence(FenceMode::Reject);
        assert!(f.check_target(Vec3::new(6.0, 0.0, -1.0)).is_err());
        assert!(f.check_target(Vec3::new(4.0, 0.0, -1.0)).is_ok());

        let out = ControlOutput::Position(PositionSetpoint::at(Vec3::new(6.0, 0.0, -1.0), None));
        assert!(matches!(f.apply(out, Vec3::new(0.0, 0.0, -1.0)), FenceVerdict::Violation(_)));
    }

    #[test]
    fn clip_mode_clamps_to_nearest_point() {
        let f = fence(FenceMode::Clip);
        let out = ControlOutput::Position(PositionSetpoint::at(Vec3::new(6.0, -7.0, -1.0), Some(90.0)));
        match f.apply(out, Vec3::new(0.0, 0.0, -1.0)) {
            FenceVerdict::Clipped { output: ControlOutput::Position(sp), .. } => {
                assert_eq!(sp.position, Vec3::new(5.0, -5.0, -1.0));
                assert_eq!(sp.yaw, Some(90.0));
            }
            other => panic!("unexpected verdict {:?}", other),
        }

        let inside = ControlOutput::Position(PositionSetpoint::at(Vec3::new(1.0, 1.0, -1.0), None));
        assert_eq!(f.apply(inside, Vec3::ZERO), FenceVerdict::Pass(inside));
    }

    #[test]
    fn clip_mode_stops_outward_velocity_at_face() {
        let f = fence(FenceMode::Clip);
        let out = ControlOutput::Velocity(VelocitySetpoint { velocity: Vec3::new(1.0, 1.0, 0.0), yaw_rate: 0.0 });
        match f.apply(out, Vec3::new(5.0, 0.0, -1.0)) {
            FenceVerdict::Clipped { output: ControlOutput::Velocity(sp), .. } => {
                assert_eq!(sp.velocity, Vec3::new(0.0, 1.0, 0.0));
            }
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn margins_shrink_the_box() {
        let g = RectLocalFence::new(Vec3::new(-5.0, -5.0, -10.0), Vec3::new(5.0, 5.0, 0.0), 0.5, 0.5).unwrap();
        assert!(!g.contains(Vec3::new(4.5, 0.0, -2.0)));
        assert!(g.contains_raw(Vec3::new(4.5, 0.0, -2.0)));
        assert_eq!(g.clamp(Vec3::new(9.0, 0.0, 0.0)), Vec3::new(4.0, 0.0, -1.0));
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(matches!(
            RectLocalFence::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 1.0), 0.0, 0.0),
            Err(FenceError::InvalidBounds { axis: "north", .. })
        ));
        assert!(matches!(
            RectLocalFence::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0), 0.3, 0.3),
            Err(FenceError::TooSmall { .. })
        ));
        assert_eq!(
            RectLocalFence::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0), -0.1, 0.0),
            Err(FenceError::NegativeMargin)
        );
    }

    #[test]
    fn parses_config_section() {
        let cfg: FenceConfig = toml::from_str(
            r#"
            north = [-5.0, 5.0]
            east = [-5.0, 5.0]
            down = [-10.0, 0.0]
            mode = "clip"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.mode, FenceMode::Clip);
        assert_eq!(cfg.vehicle_size, 0.0);
    }
}
