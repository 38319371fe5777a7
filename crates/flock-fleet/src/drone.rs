use flock_fc::{lock, ConnectionAdapter, ConnectionAddress};
use flock_nav::{FenceConfig, FenceEngine, FenceMode, KinematicLimits, NavConfig};
use flock_proto::{
    CommandKind, CommandSpec, CommandStatus, ConnectionState, EventKind, FleetEvent, TelemetrySample, Vec3,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::command::{Command, CommandHandle, CommandReport};
use crate::control;
use crate::error::CommandError;
use crate::scheduler::CommandScheduler;

/// Per-drone settings injected at connect time.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DroneConfig {
    pub telemetry_hz: f64,
    pub control_hz: f64,
    pub connect_timeout_s: f64,
    /// Completion predicates must hold this long
    pub debounce_s: f64,
    pub fence: Option<FenceConfig>,
    pub limits: KinematicLimits,
    pub nav: NavConfig,
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            telemetry_hz: 10.0,
            control_hz: 20.0,
            connect_timeout_s: 5.0,
            debounce_s: 0.5,
            fence: None,
            limits: KinematicLimits::default(),
            nav: NavConfig::default(),
        }
    }
}

impl DroneConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_s.max(0.0))
    }

    pub fn control_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.control_hz.max(1.0))
    }

    pub fn debounce_ticks(&self) -> u32 {
        ((self.debounce_s * self.control_hz.max(1.0)).ceil() as u32).max(1)
    }
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroneStatus {
    pub name: String,
    pub address: String,
    pub connection: ConnectionState,
    pub position: Vec3,
    pub yaw: f64,
    pub mode: String,
    pub armed: bool,
    pub in_air: bool,
    pub queue_depth: usize,
    pub paused: bool,
    pub current_command: Option<CommandReport>,
    pub last_command: Option<CommandReport>,
}

/// State shared between a [`Drone`] handle and its control loop.
pub(crate) struct DroneShared {
    pub name: String,
    pub cfg: DroneConfig,
    pub adapter: Arc<dyn ConnectionAdapter>,
    pub scheduler: Mutex<CommandScheduler>,
    pub fence: RwLock<Option<Arc<FenceEngine>>>,
    pub limits: RwLock<Arc<KinematicLimits>>,
    /// Replacement waypoints for the running FollowPath command, by command id.
    pub path_update: Mutex<Option<(u64, Vec<Vec3>)>>,
    pub connection: watch::Sender<ConnectionState>,
    pub events: broadcast::Sender<FleetEvent>,
}

impl DroneShared {
    pub fn fence(&self) -> Option<Arc<FenceEngine>> {
        self.fence.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn limits(&self) -> Arc<KinematicLimits> {
        self.limits.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_connection(&self, state: ConnectionState) {
        if *self.connection.borrow() == state {
            return;
        }
        self.connection.send_replace(state);
        info!("drone {}: connection {:?}", self.name, state);
        let _ = self.events.send(FleetEvent::now(&self.name, EventKind::Connection { state }));
    }

    pub fn fence_event(&self, message: &str) {
        warn!("drone {}: fence: {}", self.name, message);
        let _ = self.events.send(FleetEvent::now(&self.name, EventKind::Fence { message: message.to_string() }));
    }
}

/// One connected vehicle: telemetry cache, command scheduler and control loop.
pub struct Drone {
    shared: Arc<DroneShared>,
    address: ConnectionAddress,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drone {
    pub(crate) fn start(
        name: &str,
        address: ConnectionAddress,
        adapter: Arc<dyn ConnectionAdapter>,
        cfg: DroneConfig,
        fence: Option<FenceEngine>,
        events: broadcast::Sender<FleetEvent>,
    ) -> Self {
        let (connection, _) = watch::channel(ConnectionState::Connected);
        let shared = Arc::new(DroneShared {
            name: name.to_string(),
            scheduler: Mutex::new(CommandScheduler::new(name, events.clone())),
            fence: RwLock::new(fence.map(Arc::new)),
            limits: RwLock::new(Arc::new(cfg.limits)),
            path_update: Mutex::new(None),
            connection,
            events,
            adapter,
            cfg,
        });
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(control::run(shared.clone(), stop_rx));
        Self { shared, address, stop, task: Mutex::new(Some(task)) }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn address(&self) -> &ConnectionAddress {
        &self.address
    }

    pub fn config(&self) -> &DroneConfig {
        &self.shared.cfg
    }

    pub fn telemetry(&self) -> TelemetrySample {
        self.shared.adapter.telemetry().borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.borrow()
    }

    /// Submits a command. Under a rejecting fence, targets known at submission
    /// time are checked here and a violating command fails without running.
    pub fn submit(&self, command: impl Into<Command>, scheduled: bool) -> CommandHandle {
        let command = command.into();
        if let Some(fence) = self.shared.fence() {
            if fence.mode() == FenceMode::Reject {
                if let Err(msg) = self.precheck(&fence, &command.spec) {
                    self.shared.fence_event(&msg);
                    return lock(&self.shared.scheduler).reject(command, CommandError::FenceViolation(msg));
                }
            }
        }
        lock(&self.shared.scheduler).submit(command, scheduled)
    }

    fn precheck(&self, fence: &FenceEngine, spec: &CommandSpec) -> Result<(), String> {
        match spec {
            CommandSpec::FlyTo { target, .. } => fence.check_target(*target),
            CommandSpec::FollowPath { waypoints, .. } => waypoints.iter().try_for_each(|w| fence.check_target(*w)),
            CommandSpec::Takeoff { altitude } => {
                let t = self.telemetry();
                fence.check_target(Vec3::new(t.position.x, t.position.y, t.position.z - altitude))
            }
            _ => Ok(()),
        }
    }

    pub fn cancel_all(&self) {
        lock(&self.shared.scheduler).cancel_all("canceled by operator");
    }

    /// Freezes the running command and holds position; queued commands wait.
    pub fn pause(&self) {
        lock(&self.shared.scheduler).pause();
    }

    pub fn resume(&self) {
        lock(&self.shared.scheduler).resume();
    }

    pub fn set_flight_mode(&self, mode: &str, scheduled: bool) -> CommandHandle {
        self.submit(CommandSpec::FlightMode { mode: mode.to_string() }, scheduled)
    }

    pub fn status(&self) -> DroneStatus {
        let t = self.telemetry();
        let s = lock(&self.shared.scheduler).status();
        DroneStatus {
            name: self.shared.name.clone(),
            address: self.address.to_string(),
            connection: self.connection_state(),
            position: t.position,
            yaw: t.yaw_deg(),
            mode: t.flight_mode,
            armed: t.armed,
            in_air: t.in_air,
            queue_depth: s.queue_depth,
            paused: s.paused,
            current_command: s.running,
            last_command: s.last,
        }
    }

    /// Replaces the remaining waypoints of the running FollowPath command.
    pub fn update_path(&self, waypoints: Vec<Vec3>) -> Result<(), CommandError> {
        if waypoints.is_empty() {
            return Err(CommandError::ScheduleConflict("empty waypoint list".into()));
        }
        let running = lock(&self.shared.scheduler).status().running;
        let id = match running {
            Some(r) if r.kind == CommandKind::FollowPath && r.status == CommandStatus::Running => r.id,
            _ => return Err(CommandError::ScheduleConflict("no path is being followed".into())),
        };
        if let Some(fence) = self.shared.fence().filter(|f| f.mode() == FenceMode::Reject) {
            if let Some(msg) = waypoints.iter().find_map(|w| fence.check_target(*w).err()) {
                self.shared.fence_event(&msg);
                return Err(CommandError::FenceViolation(msg));
            }
        }
        *lock(&self.shared.path_update) = Some((id, waypoints));
        Ok(())
    }

    /// New fence for commands started from now on; running commands keep theirs.
    pub fn set_fence(&self, fence: Option<FenceEngine>) {
        info!("drone {}: fence {}", self.shared.name, fence.as_ref().map(|f| f.geometry().to_string()).unwrap_or_else(|| "disabled".into()));
        *self.shared.fence.write().unwrap_or_else(PoisonError::into_inner) = fence.map(Arc::new);
    }

    pub fn set_limits(&self, limits: KinematicLimits) {
        *self.shared.limits.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(limits);
    }

    /// Forced disarm; the queue is canceled first so nothing re-arms.
    pub async fn kill(&self) -> Result<(), CommandError> {
        warn!("drone {}: kill", self.shared.name);
        lock(&self.shared.scheduler).cancel_all("killed");
        self.shared.adapter.kill().await.map_err(CommandError::from)
    }

    /// Stops the control loop and closes the link.
    pub(crate) async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        lock(&self.shared.scheduler).close(None);
        self.shared.adapter.close().await;
        self.shared.set_connection(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_in_ticks() {
        let cfg = DroneConfig::default();
        assert_eq!(cfg.debounce_ticks(), 10);
        assert_eq!(cfg.control_period(), Duration::from_millis(50));
        let zero = DroneConfig { debounce_s: 0.0, ..DroneConfig::default() };
        assert_eq!(zero.debounce_ticks(), 1);
    }
}
