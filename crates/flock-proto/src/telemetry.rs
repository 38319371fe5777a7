use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

/// Vehicle attitude in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub ts_unix_ms: i64,
    /// Incremented by the adapter for every published sample.
    pub seq: u64,
    pub position: Vec3,
    pub velocity: Vec3,
    pub attitude: Attitude,
    pub armed: bool,
    pub in_air: bool,
    pub flight_mode: String,
    /// Home position in the local frame, once the flight controller reported it.
    pub home: Option<Vec3>,
}

impl Default for TelemetrySample {
    fn default() -> Self {
        Self {
            ts_unix_ms: 0,
            seq: 0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            attitude: Attitude::default(),
            armed: false,
            in_air: false,
            flight_mode: "UNKNOWN".to_string(),
            home: None,
        }
    }
}

impl TelemetrySample {
    pub fn yaw_deg(&self) -> f64 {
        self.attitude.yaw
    }

    /// Height above the local origin (positive up).
    pub fn altitude(&self) -> f64 {
        -self.position.z
    }
}
