use flock_proto::{CommandKind, CommandSpec, CommandStatus};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::CommandError;

/// A command as submitted to a drone.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub spec: CommandSpec,
    /// Fails the command if it is still running after this long.
    pub watchdog: Option<Duration>,
}

impl Command {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec, watchdog: None }
    }

    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn kind(&self) -> CommandKind {
        self.spec.kind()
    }
}

impl From<CommandSpec> for Command {
    fn from(spec: CommandSpec) -> Self {
        Self::new(spec)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReport {
    pub id: u64,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub error: Option<CommandError>,
    /// Human-readable reason for Failed and Canceled.
    pub reason: Option<String>,
}

impl CommandReport {
    pub(crate) fn new(id: u64, kind: CommandKind) -> Self {
        Self { id, kind, status: CommandStatus::Pending, error: None, reason: None }
    }
}

/// Caller's view of one submitted command.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    id: u64,
    rx: watch::Receiver<CommandReport>,
}

impl CommandHandle {
    pub(crate) fn new(id: u64, rx: watch::Receiver<CommandReport>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn report(&self) -> CommandReport {
        self.rx.borrow().clone()
    }

    pub fn status(&self) -> CommandStatus {
        self.rx.borrow().status
    }

    /// Resolves once the command reached a terminal status.
    pub async fn wait(&mut self) -> CommandReport {
        loop {
            {
                let report = self.rx.borrow_and_update();
                if report.status.is_terminal() {
                    return report.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}
