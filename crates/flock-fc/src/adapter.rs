//! The seam between the fleet core and a flight controller.
//!
//! Everything the core needs from a vehicle goes through [`ConnectionAdapter`]:
//! a telemetry stream and a small set of command primitives, each of which
//! resolves once the flight controller accepted or denied it.

use async_trait::async_trait;
use flock_proto::{ConnectionState, PositionSetpoint, TelemetrySample, VelocitySetpoint};
use std::sync::Arc;
use tokio::sync::watch;

use crate::address::ConnectionAddress;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error("{command} denied: {reason}")]
    Denied { command: String, reason: String },

    #[error("{command} not acknowledged within {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("link error: {0}")]
    Link(String),

    #[error("invalid address {address}: {reason}")]
    Address { address: String, reason: String },
}

impl AdapterError {
    pub fn denied(command: &str, reason: impl Into<String>) -> Self {
        AdapterError::Denied { command: command.to_string(), reason: reason.into() }
    }
}

#[async_trait]
pub trait ConnectionAdapter: Send + Sync {
    /// Latest-value telemetry cache, updated at the configured telemetry rate.
    fn telemetry(&self) -> watch::Receiver<TelemetrySample>;

    /// `Connected` while heartbeats arrive, `Lost` once they stopped.
    fn link_state(&self) -> ConnectionState;

    async fn arm(&self) -> Result<(), AdapterError>;

    async fn disarm(&self) -> Result<(), AdapterError>;

    /// Stops the motors regardless of flight state.
    async fn kill(&self) -> Result<(), AdapterError>;

    /// Altitude in meters above the current ground level.
    async fn request_takeoff(&self, altitude: f64) -> Result<(), AdapterError>;

    async fn land(&self) -> Result<(), AdapterError>;

    /// Switches the autopilot mode by name, e.g. `HOLD` or `POSCTL`.
    async fn set_flight_mode(&self, mode: &str) -> Result<(), AdapterError>;

    async fn set_position_setpoint(&self, setpoint: &PositionSetpoint) -> Result<(), AdapterError>;

    async fn set_velocity_setpoint(&self, setpoint: &VelocitySetpoint) -> Result<(), AdapterError>;

    async fn close(&self);
}

/// Opens adapters. The fleet manager bounds `connect` with its own timeout.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        address: &ConnectionAddress,
        telemetry_hz: f64,
    ) -> Result<Arc<dyn ConnectionAdapter>, AdapterError>;
}
