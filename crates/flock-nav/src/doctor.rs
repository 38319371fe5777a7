use anyhow::{Context, Result};

use crate::fence::{FenceConfig, FenceEngine};
use crate::{KinematicLimits, NavConfig};

pub fn check_limits(limits: &KinematicLimits) -> Result<()> {
    for (name, l) in [("horizontal", limits.horizontal), ("vertical", limits.vertical)] {
        anyhow::ensure!(l.velocity > 0.0 && l.velocity <= 30.0, "limits.{}.velocity should be in (0, 30] m/s", name);
        anyhow::ensure!(l.acceleration > 0.0 && l.acceleration <= 20.0, "limits.{}.acceleration should be in (0, 20] m/s^2", name);
        anyhow::ensure!(l.jerk > 0.0 && l.jerk <= 100.0, "limits.{}.jerk should be in (0, 100] m/s^3", name);
    }
    Ok(())
}

pub fn check_fence(cfg: &FenceConfig) -> Result<()> {
    let fence = FenceEngine::from_config(cfg).context("fence")?;
    // Takeoff starts on the ground, the down bound should include it
    anyhow::ensure!(fence.geometry().contains_raw(flock_proto::Vec3::ZERO), "fence does not contain the local origin");
    Ok(())
}

pub fn check_nav(cfg: &NavConfig) -> Result<()> {
    anyhow::ensure!(cfg.tolerance > 0.0 && cfg.tolerance <= 5.0, "nav.tolerance should be in (0, 5] m");
    anyhow::ensure!(cfg.yaw_tolerance > 0.0 && cfg.yaw_tolerance < 180.0, "nav.yaw_tolerance should be in (0, 180) deg");
    anyhow::ensure!(cfg.velocity_gain > 0.0, "nav.velocity_gain must be positive");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::FenceMode;

    #[test]
    fn defaults_pass() {
        check_limits(&KinematicLimits::default()).unwrap();
        check_nav(&NavConfig::default()).unwrap();
    }

    #[test]
    fn fence_must_contain_origin() {
        let mut cfg = FenceConfig {
            north: [-5.0, 5.0],
            east: [-5.0, 5.0],
            down: [-10.0, 0.0],
            vehicle_size: 0.0,
            safety_margin: 0.0,
            mode: FenceMode::Reject,
        };
        check_fence(&cfg).unwrap();
        cfg.north = [1.0, 5.0];
        assert!(check_fence(&cfg).is_err());
        cfg.north = [5.0, -5.0];
        assert!(check_fence(&cfg).is_err());
    }
}
