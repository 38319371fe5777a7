//! Per-drone command queue.
//!
//! At most one command runs at a time. Scheduled submissions queue behind it
//! in FIFO order; an unscheduled submission cancels the running command and
//! every pending entry and becomes the running command in the same step.
//! The scheduler is plain state: the drone's control loop drives it through
//! [`CommandScheduler::activate`] and [`CommandScheduler::finish`].
//!
//! A paused scheduler keeps its running command but promotes nothing until
//! it is resumed; the control loop holds position meanwhile.

use flock_proto::{CommandStatus, EventKind, FleetEvent};
use std::collections::VecDeque;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::command::{Command, CommandHandle, CommandReport};
use crate::error::CommandError;

struct Entry {
    id: u64,
    command: Command,
    tx: watch::Sender<CommandReport>,
}

/// Running command and queue depth at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatus {
    pub running: Option<CommandReport>,
    pub queue_depth: usize,
    pub paused: bool,
    /// Most recent command that reached a terminal status.
    pub last: Option<CommandReport>,
}

pub struct CommandScheduler {
    drone: String,
    running: Option<Entry>,
    pending: VecDeque<Entry>,
    next_id: u64,
    paused: bool,
    closed: Option<CommandError>,
    last: Option<CommandReport>,
    events: broadcast::Sender<FleetEvent>,
}

impl CommandScheduler {
    pub fn new(drone: &str, events: broadcast::Sender<FleetEvent>) -> Self {
        Self {
            drone: drone.to_string(),
            running: None,
            pending: VecDeque::new(),
            next_id: 1,
            paused: false,
            closed: None,
            last: None,
            events,
        }
    }

    fn entry(&mut self, command: Command) -> (Entry, CommandHandle) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = watch::channel(CommandReport::new(id, command.kind()));
        (Entry { id, command, tx }, CommandHandle::new(id, rx))
    }

    pub fn submit(&mut self, command: Command, scheduled: bool) -> CommandHandle {
        let (entry, handle) = self.entry(command);
        if let Some(err) = self.closed.clone() {
            self.terminate(entry, CommandStatus::Failed, Some(err), None);
            return handle;
        }

        if scheduled {
            self.emit(&entry, CommandStatus::Pending, None);
            self.pending.push_back(entry);
        } else {
            self.cancel_all(&format!("superseded by command {}", entry.id));
            self.start(entry);
        }
        handle
    }

    /// Fails `command` right away without touching the queue.
    pub fn reject(&mut self, command: Command, error: CommandError) -> CommandHandle {
        let (entry, handle) = self.entry(command);
        self.terminate(entry, CommandStatus::Failed, Some(error), None);
        handle
    }

    /// Promotes the queue head when nothing runs; returns the running command id.
    pub fn activate(&mut self) -> Option<u64> {
        if self.running.is_none() && !self.paused {
            if let Some(entry) = self.pending.pop_front() {
                self.start(entry);
            }
        }
        self.running.as_ref().map(|e| e.id)
    }

    pub fn command(&self, id: u64) -> Option<&Command> {
        self.running.as_ref().filter(|e| e.id == id).map(|e| &e.command)
    }

    /// Records the outcome of the running command `id`. Ignored when `id` is no
    /// longer running (it was superseded or canceled meanwhile).
    ///
    /// A failure aborts the rest of the queue: pending entries are canceled and
    /// nothing further runs until a new command is submitted.
    pub fn finish(&mut self, id: u64, result: Result<(), CommandError>) {
        if self.running.as_ref().map(|e| e.id) != Some(id) {
            return;
        }
        let Some(entry) = self.running.take() else { return };
        match result {
            Ok(()) => self.terminate(entry, CommandStatus::Succeeded, None, None),
            Err(err) => {
                self.terminate(entry, CommandStatus::Failed, Some(err), None);
                let reason = format!("queue aborted after command {} failed", id);
                while let Some(p) = self.pending.pop_front() {
                    self.terminate(p, CommandStatus::Canceled, None, Some(reason.clone()));
                }
            }
        }
    }

    /// Cancels the running command and clears the queue.
    pub fn cancel_all(&mut self, reason: &str) {
        if let Some(entry) = self.running.take() {
            self.terminate(entry, CommandStatus::Canceled, None, Some(reason.to_string()));
        }
        while let Some(entry) = self.pending.pop_front() {
            self.terminate(entry, CommandStatus::Canceled, None, Some(reason.to_string()));
        }
    }

    /// Ends the scheduler for good. The running command fails with `error`
    /// (or is canceled without one), later submissions fail immediately.
    pub fn close(&mut self, error: Option<CommandError>) {
        let reason = error.as_ref().map(ToString::to_string).unwrap_or_else(|| "drone disconnected".to_string());
        if let Some(entry) = self.running.take() {
            match &error {
                Some(err) => self.terminate(entry, CommandStatus::Failed, Some(err.clone()), None),
                None => self.terminate(entry, CommandStatus::Canceled, None, Some(reason.clone())),
            }
        }
        while let Some(entry) = self.pending.pop_front() {
            self.terminate(entry, CommandStatus::Canceled, None, Some(reason.clone()));
        }
        self.closed = Some(error.unwrap_or_else(|| CommandError::ScheduleConflict(reason)));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn pause(&mut self) {
        if !self.paused {
            info!("drone {}: paused with {} queued", self.drone, self.pending.len());
        }
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if self.paused {
            info!("drone {}: resumed", self.drone);
        }
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running.as_ref().map(|e| e.tx.borrow().clone()),
            queue_depth: self.pending.len(),
            paused: self.paused,
            last: self.last.clone(),
        }
    }

    fn start(&mut self, entry: Entry) {
        entry.tx.send_modify(|r| r.status = CommandStatus::Running);
        self.emit(&entry, CommandStatus::Running, None);
        self.running = Some(entry);
    }

    fn terminate(&mut self, entry: Entry, status: CommandStatus, error: Option<CommandError>, reason: Option<String>) {
        let reason = reason.or_else(|| error.as_ref().map(ToString::to_string));
        entry.tx.send_modify(|r| {
            r.status = status;
            r.error = error;
            r.reason = reason.clone();
        });
        self.emit(&entry, status, reason);
        self.last = Some(entry.tx.borrow().clone());
    }

    fn emit(&self, entry: &Entry, status: CommandStatus, reason: Option<String>) {
        let kind = entry.command.kind();
        match (status, &reason) {
            (CommandStatus::Failed | CommandStatus::Canceled, Some(r)) => {
                warn!("drone {}: command {} ({}) {:?}: {}", self.drone, entry.id, kind, status, r)
            }
            _ => info!("drone {}: command {} ({}) {:?}", self.drone, entry.id, kind, status),
        }
        let _ = self.events.send(FleetEvent::now(
            &self.drone,
            EventKind::Command { id: entry.id, kind, status, reason },
        ));
    }
}
