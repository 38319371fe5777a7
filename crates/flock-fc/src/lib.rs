pub mod adapter;
pub mod address;
pub mod mav;
pub mod safety;
pub mod sim;
pub mod state;
pub mod udp;

pub use adapter::{AdapterError, ConnectionAdapter, Connector};
pub use address::{ConnectionAddress, Scheme};
pub use mav::{MavlinkAdapter, MavlinkConnector};
pub use sim::{SimAdapter, SimConfig, SimConnector};

use serde::Deserialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// MAVLink ids we use (ground station side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (FC side). 1/1 is common for PX4 and ArduPilot.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Require seeing an FC heartbeat before the connection counts as established
    pub require_heartbeat: bool,

    /// Companion heartbeat send rate. Default 1 Hz.
    pub send_heartbeat_hz: Option<f32>,

    /// How long to wait for a COMMAND_ACK
    pub ack_timeout_ms: u64,

    /// Link is considered lost when no heartbeat arrived for this long
    pub link_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            sys_id: 246,
            comp_id: 190,
            target_sys: 1,
            target_comp: 1,
            require_heartbeat: true,
            send_heartbeat_hz: None,
            ack_timeout_ms: 3000,
            link_timeout_ms: 3000,
        }
    }
}

impl LinkConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        let hz = self.send_heartbeat_hz.unwrap_or(1.0).max(0.2);
        Duration::from_secs_f32(1.0 / hz)
    }
}

/// Locks `m`, taking the data over from a panicked holder.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
