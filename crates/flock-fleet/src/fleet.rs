use flock_fc::{ConnectionAddress, Connector};
use flock_nav::{FenceConfig, FenceEngine, KinematicLimits};
use flock_proto::{CommandSpec, ConnectionState, EventKind, FleetEvent};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::command::{Command, CommandHandle};
use crate::drone::{Drone, DroneConfig, DroneStatus};
use crate::error::FleetError;

const EVENT_CAPACITY: usize = 1024;

type Registry = Arc<HashMap<String, Arc<Drone>>>;

/// Registry of named drones.
///
/// Connect and disconnect are serialized by one writer lock and publish a new
/// registry snapshot when they complete, so readers never see a drone that is
/// still being set up.
pub struct FleetManager {
    connector: Arc<dyn Connector>,
    defaults: DroneConfig,
    drones: RwLock<Registry>,
    writer: Mutex<()>,
    events: broadcast::Sender<FleetEvent>,
}

impl FleetManager {
    pub fn new(connector: Arc<dyn Connector>, defaults: DroneConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { connector, defaults, drones: RwLock::new(Arc::new(HashMap::new())), writer: Mutex::new(()), events }
    }

    pub fn defaults(&self) -> &DroneConfig {
        &self.defaults
    }

    /// Point-in-time view of the registry.
    pub fn snapshot(&self) -> Registry {
        self.drones.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn publish(&self, registry: HashMap<String, Arc<Drone>>) {
        *self.drones.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(registry);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    fn emit(&self, drone: &str, state: ConnectionState) {
        let _ = self.events.send(FleetEvent::now(drone, EventKind::Connection { state }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Drone>> {
        self.snapshot().get(name).cloned()
    }

    fn drone(&self, name: &str) -> Result<Arc<Drone>, FleetError> {
        self.get(name).ok_or_else(|| FleetError::UnknownDrone(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    /// Connects a new drone. A drone whose link was lost may be reconnected
    /// under the same name; the stale entry is closed first.
    pub async fn connect(&self, name: &str, address: &str, cfg: Option<DroneConfig>) -> Result<Arc<Drone>, FleetError> {
        let cfg = cfg.unwrap_or_else(|| self.defaults.clone());
        let address = ConnectionAddress::parse(address).map_err(FleetError::Address)?;
        let fence = cfg
            .fence
            .as_ref()
            .map(FenceEngine::from_config)
            .transpose()
            .map_err(|e| FleetError::Config(e.to_string()))?;

        let _writer = self.writer.lock().await;
        let mut registry = (*self.snapshot()).clone();

        if let Some(existing) = registry.get(name) {
            if existing.connection_state() != ConnectionState::Lost {
                return Err(FleetError::DuplicateName(name.to_string()));
            }
            info!("fleet: replacing {} after link loss", name);
            existing.shutdown().await;
            registry.remove(name);
        }
        if let Some(owner) = registry.values().find(|d| d.address().same_endpoint(&address)) {
            return Err(FleetError::AddressInUse { address: address.to_string(), owner: owner.name().to_string() });
        }

        info!("fleet: connecting {} at {}", name, address);
        self.emit(name, ConnectionState::Connecting);
        let connected = tokio::time::timeout(
            cfg.connect_timeout(),
            self.connector.connect(name, &address, cfg.telemetry_hz),
        )
        .await;
        let adapter = match connected {
            Ok(Ok(adapter)) => adapter,
            Ok(Err(e)) => {
                warn!("fleet: connecting {} failed: {}", name, e);
                self.emit(name, ConnectionState::Disconnected);
                return Err(FleetError::Connection { name: name.to_string(), reason: e.to_string() });
            }
            Err(_) => {
                warn!("fleet: connecting {} timed out", name);
                self.emit(name, ConnectionState::Disconnected);
                return Err(FleetError::Connection {
                    name: name.to_string(),
                    reason: format!("timed out after {:.1} s", cfg.connect_timeout().as_secs_f64()),
                });
            }
        };

        let drone = Arc::new(Drone::start(name, address, adapter, cfg, fence, self.events.clone()));
        registry.insert(name.to_string(), drone.clone());
        self.publish(registry);
        self.emit(name, ConnectionState::Connected);
        info!("fleet: {} connected", name);
        Ok(drone)
    }

    /// Removes a drone. Refused while it is armed or in the air unless `force`.
    pub async fn disconnect(&self, name: &str, force: bool) -> Result<(), FleetError> {
        let _writer = self.writer.lock().await;
        let mut registry = (*self.snapshot()).clone();
        let drone = registry.get(name).cloned().ok_or_else(|| FleetError::UnknownDrone(name.to_string()))?;

        let t = drone.telemetry();
        let live = drone.connection_state() == ConnectionState::Connected;
        if live && (t.armed || t.in_air) && !force {
            return Err(FleetError::Busy(name.to_string()));
        }

        registry.remove(name);
        self.publish(registry);
        drone.shutdown().await;
        info!("fleet: {} disconnected", name);
        Ok(())
    }

    pub fn submit(&self, name: &str, command: impl Into<Command>, scheduled: bool) -> Result<CommandHandle, FleetError> {
        Ok(self.drone(name)?.submit(command, scheduled))
    }

    fn targets(&self, names: &[String]) -> Vec<String> {
        if names.is_empty() { self.names() } else { names.to_vec() }
    }

    /// Submits `command` to each named drone (all drones when `names` is
    /// empty). Each handle completes on its own.
    pub fn submit_fleet(
        &self,
        command: impl Into<Command>,
        names: &[String],
        scheduled: bool,
    ) -> Vec<(String, Result<CommandHandle, FleetError>)> {
        let command = command.into();
        self.targets(names)
            .into_iter()
            .map(|name| {
                let handle = self.submit(&name, command.clone(), scheduled);
                (name, handle)
            })
            .collect()
    }

    pub fn query_status(&self, name: &str) -> Result<DroneStatus, FleetError> {
        Ok(self.drone(name)?.status())
    }

    pub fn set_fence(&self, names: &[String], fence: Option<&FenceConfig>) -> Result<(), FleetError> {
        let engine = fence
            .map(FenceEngine::from_config)
            .transpose()
            .map_err(|e| FleetError::Config(e.to_string()))?;
        for name in self.targets(names) {
            self.drone(&name)?.set_fence(engine.clone());
        }
        Ok(())
    }

    pub fn set_limits(&self, names: &[String], limits: KinematicLimits) -> Result<(), FleetError> {
        for name in self.targets(names) {
            self.drone(&name)?.set_limits(limits);
        }
        Ok(())
    }

    /// Pauses task execution on the named drones (all when empty).
    pub fn pause(&self, names: &[String]) -> Result<(), FleetError> {
        info!("fleet: pause {:?}", names);
        for name in self.targets(names) {
            self.drone(&name)?.pause();
        }
        Ok(())
    }

    pub fn resume(&self, names: &[String]) -> Result<(), FleetError> {
        info!("fleet: resume {:?}", names);
        for name in self.targets(names) {
            self.drone(&name)?.resume();
        }
        Ok(())
    }

    pub fn set_flight_mode(
        &self,
        names: &[String],
        mode: &str,
        scheduled: bool,
    ) -> Vec<(String, Result<CommandHandle, FleetError>)> {
        info!("fleet: flight mode {} for {:?}", mode, names);
        self.submit_fleet(CommandSpec::FlightMode { mode: mode.to_string() }, names, scheduled)
    }

    /// Lands the named drones (all when empty), superseding whatever they do.
    pub fn stop(&self, names: &[String]) -> Vec<(String, Result<CommandHandle, FleetError>)> {
        warn!("fleet: stop {:?}", names);
        self.submit_fleet(CommandSpec::Land, names, false)
    }

    /// Forced disarm of the named drones (all when empty). Every kill is
    /// dispatched at once; an unresponsive link only delays its own result.
    pub async fn kill(&self, names: &[String]) -> Vec<(String, Result<(), FleetError>)> {
        let mut results = Vec::new();
        let mut kills = JoinSet::new();
        for name in self.targets(names) {
            match self.drone(&name) {
                Ok(drone) => {
                    kills.spawn(async move {
                        let r = drone.kill().await.map_err(FleetError::from);
                        (name, r)
                    });
                }
                Err(e) => results.push((name, Err(e))),
            }
        }
        while let Some(joined) = kills.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("fleet: kill task failed: {}", e),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Force-disconnects every drone.
    pub async fn close(&self) {
        for name in self.names() {
            if let Err(e) = self.disconnect(&name, true).await {
                warn!("fleet: closing {}: {}", name, e);
            }
        }
    }
}
