use flock_fc::AdapterError;
use serde::Serialize;

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
pub enum CommandError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("fence violation: {0}")]
    FenceViolation(String),

    #[error("schedule conflict: {0}")]
    ScheduleConflict(String),

    #[error("navigation divergence: {0}")]
    NavigationDivergence(String),
}

/// Only an explicit denial is a rejection. An unanswered command says nothing
/// about the vehicle's opinion and counts against the link.
impl From<AdapterError> for CommandError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Denied { .. } => CommandError::Rejected(e.to_string()),
            AdapterError::Timeout { .. } | AdapterError::Link(_) | AdapterError::Address { .. } => {
                CommandError::Connection(e.to_string())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("unknown drone {0}")]
    UnknownDrone(String),

    #[error("drone {0} already exists")]
    DuplicateName(String),

    #[error("address {address} already used by drone {owner}")]
    AddressInUse { address: String, owner: String },

    #[error(transparent)]
    Address(AdapterError),

    #[error("connection to {name} failed: {reason}")]
    Connection { name: String, reason: String },

    #[error("drone {0} is armed or in the air, disconnect with force to override")]
    Busy(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_errors_map_to_command_errors() {
        let denied: CommandError = AdapterError::denied("arm", "no gps fix").into();
        assert!(matches!(denied, CommandError::Rejected(ref m) if m.contains("no gps fix")));

        let timeout: CommandError = AdapterError::Timeout { command: "land".into(), timeout_ms: 3000 }.into();
        assert!(matches!(timeout, CommandError::Connection(_)));

        let link: CommandError = AdapterError::Link("no route to vehicle".into()).into();
        assert!(matches!(link, CommandError::Connection(_)));
    }
}
