use serde::{Deserialize, Serialize};

use crate::command::{CommandKind, CommandStatus};
use crate::telemetry::ConnectionState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    Connection { state: ConnectionState },
    Command { id: u64, kind: CommandKind, status: CommandStatus, reason: Option<String> },
    Fence { message: String },
}

/// One record of the status/event feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEvent {
    pub ts_unix_ms: i64,
    pub drone: String,
    pub kind: EventKind,
}

impl FleetEvent {
    pub fn now(drone: &str, kind: EventKind) -> Self {
        Self { ts_unix_ms: unix_ms_now(), drone: drone.to_string(), kind }
    }
}

pub fn unix_ms_now() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
