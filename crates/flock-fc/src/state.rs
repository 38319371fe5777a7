use flock_proto::ConnectionState;
use std::time::Duration;
use tokio::time::Instant;

/// Heartbeat bookkeeping for one flight-controller link.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub connected: bool,
    pub address: Option<String>,
    pub last_heartbeat: Option<Instant>,
    pub last_msg: Option<String>,
}

impl LinkStatus {
    pub fn new(address: &str) -> Self {
        Self { address: Some(address.to_string()), ..Self::default() }
    }

    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    pub fn on_heartbeat(&mut self) {
        self.connected = true;
        self.last_heartbeat = Some(Instant::now());
    }

    /// `Lost` once a previously healthy link has been silent longer than `timeout`.
    pub fn state(&self, timeout: Duration) -> ConnectionState {
        match (self.connected, self.hb_age()) {
            (false, _) => ConnectionState::Disconnected,
            (true, Some(age)) if age <= timeout => ConnectionState::Connected,
            (true, _) => ConnectionState::Lost,
        }
    }
}
