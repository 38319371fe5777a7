//! In-process flight controller used by tests and `flock --sim`.
//!
//! A point-mass vehicle integrated at a fixed physics rate. It acknowledges
//! commands after a short delay and denies them where a real autopilot would.

use async_trait::async_trait;
use flock_proto::{
    heading_error_deg, unix_ms_now, ConnectionState, PositionSetpoint, TelemetrySample, Vec3,
    VelocitySetpoint,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::adapter::{AdapterError, ConnectionAdapter, Connector};
use crate::address::ConnectionAddress;
use crate::lock;
use crate::state::LinkStatus;

/// Fall speed of an unpowered vehicle, m/s.
const FALL_SPEED: f64 = 5.0;
/// Height above ground below which the vehicle counts as landed.
const GROUND_EPS: f64 = 0.05;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Initial (ground) position in the local frame.
    pub start: Vec3,
    pub start_yaw: f64,
    /// Horizontal speed limit, m/s
    pub max_speed: f64,
    /// Vertical speed limit, also used for takeoff and landing
    pub climb_rate: f64,
    /// Position loop gain, 1/s
    pub response: f64,
    /// deg/s
    pub yaw_rate: f64,
    pub physics_hz: f64,
    pub ack_delay_ms: u64,
    pub ack_timeout_ms: u64,
    pub link_timeout_ms: u64,
    pub connect_delay_ms: u64,
    /// Uniform position noise amplitude on published telemetry, meters
    pub noise: f64,
    pub seed: u64,
    /// Arm requests are denied with this reason
    pub deny_arm: Option<String>,
    /// Connection attempts never complete
    pub unreachable: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            start: Vec3::ZERO,
            start_yaw: 0.0,
            max_speed: 5.0,
            climb_rate: 1.5,
            response: 2.0,
            yaw_rate: 90.0,
            physics_hz: 50.0,
            ack_delay_ms: 20,
            ack_timeout_ms: 3000,
            link_timeout_ms: 3000,
            connect_delay_ms: 50,
            noise: 0.0,
            seed: 7,
            deny_arm: None,
            unreachable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Idle,
    Takeoff { z: f64 },
    Land,
    Position(PositionSetpoint),
    Velocity(VelocitySetpoint),
}

#[derive(Debug)]
struct Vehicle {
    pos: Vec3,
    vel: Vec3,
    yaw: f64,
    armed: bool,
    in_air: bool,
    mode: Mode,
}

impl Vehicle {
    fn flight_mode(&self) -> &'static str {
        match self.mode {
            Mode::Idle if self.in_air => "HOLD",
            Mode::Idle if self.armed => "READY",
            Mode::Idle => "STANDBY",
            Mode::Takeoff { .. } => "TAKEOFF",
            Mode::Land => "LAND",
            Mode::Position(_) | Mode::Velocity(_) => "OFFBOARD",
        }
    }
}

pub struct SimAdapter {
    name: String,
    cfg: SimConfig,
    ground_z: f64,
    vehicle: Mutex<Vehicle>,
    telemetry: watch::Sender<TelemetrySample>,
    status: Mutex<LinkStatus>,
    rng: Mutex<StdRng>,
    position_log: Mutex<Vec<PositionSetpoint>>,
    velocity_log: Mutex<Vec<VelocitySetpoint>>,
    command_log: Mutex<Vec<String>>,
    severed: AtomicBool,
    closed: AtomicBool,
}

impl SimAdapter {
    pub fn new(name: &str, cfg: SimConfig, telemetry_hz: f64) -> Arc<Self> {
        let vehicle = Vehicle {
            pos: cfg.start,
            vel: Vec3::ZERO,
            yaw: cfg.start_yaw,
            armed: false,
            in_air: false,
            mode: Mode::Idle,
        };
        let initial = TelemetrySample {
            ts_unix_ms: unix_ms_now(),
            position: cfg.start,
            home: Some(cfg.start),
            flight_mode: vehicle.flight_mode().to_string(),
            ..TelemetrySample::default()
        };
        let (telemetry, _) = watch::channel(initial);
        let mut status = LinkStatus::new(&format!("sim://{}", name));
        status.on_heartbeat();

        let adapter = Arc::new(Self {
            name: name.to_string(),
            ground_z: cfg.start.z,
            rng: Mutex::new(StdRng::seed_from_u64(cfg.seed)),
            cfg,
            vehicle: Mutex::new(vehicle),
            telemetry,
            status: Mutex::new(status),
            position_log: Mutex::new(Vec::new()),
            velocity_log: Mutex::new(Vec::new()),
            command_log: Mutex::new(Vec::new()),
            severed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(physics_loop(Arc::downgrade(&adapter), telemetry_hz));
        adapter
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops heartbeats and telemetry as if the radio link dropped.
    pub fn sever_link(&self) {
        info!("sim {}: link severed", self.name);
        self.severed.store(true, Ordering::Relaxed);
    }

    /// Noise-free vehicle position.
    pub fn true_position(&self) -> Vec3 {
        lock(&self.vehicle).pos
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.vehicle).armed
    }

    pub fn is_in_air(&self) -> bool {
        lock(&self.vehicle).in_air
    }

    pub fn position_setpoints(&self) -> Vec<PositionSetpoint> {
        lock(&self.position_log).clone()
    }

    pub fn velocity_setpoints(&self) -> Vec<VelocitySetpoint> {
        lock(&self.velocity_log).clone()
    }

    pub fn last_position_setpoint(&self) -> Option<PositionSetpoint> {
        lock(&self.position_log).last().copied()
    }

    /// Acknowledged command primitives in order, e.g. `["arm", "takeoff"]`.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.command_log).clone()
    }

    /// Waits like a flight controller answering over the link.
    async fn ack(&self, command: &str) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(AdapterError::Link("link closed".into()));
        }
        if self.severed.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(self.cfg.ack_timeout_ms)).await;
            return Err(AdapterError::Timeout { command: command.to_string(), timeout_ms: self.cfg.ack_timeout_ms });
        }
        tokio::time::sleep(Duration::from_millis(self.cfg.ack_delay_ms)).await;
        Ok(())
    }

    fn accepted(&self, command: &str) {
        debug!("sim {}: {} accepted", self.name, command);
        lock(&self.command_log).push(command.to_string());
    }

    fn step(&self, dt: f64) {
        let cfg = &self.cfg;
        let mut v = lock(&self.vehicle);

        match v.mode {
            Mode::Idle => {
                v.vel = if !v.armed && v.in_air { Vec3::new(0.0, 0.0, FALL_SPEED) } else { Vec3::ZERO };
            }
            Mode::Takeoff { z } => {
                v.vel = Vec3::new(0.0, 0.0, -cfg.climb_rate);
                if v.pos.z + v.vel.z * dt <= z {
                    v.pos.z = z;
                    v.vel = Vec3::ZERO;
                    v.mode = Mode::Position(PositionSetpoint::at(v.pos, None));
                }
            }
            Mode::Land => v.vel = Vec3::new(0.0, 0.0, cfg.climb_rate),
            Mode::Position(sp) => {
                let ff = sp.velocity.unwrap_or(Vec3::ZERO);
                let desired = (sp.position - v.pos) * cfg.response + ff;
                v.vel = limit(desired, cfg.max_speed, cfg.climb_rate);
                if let Some(target) = sp.yaw {
                    let err = heading_error_deg(v.yaw, target);
                    let turn = (cfg.yaw_rate * dt).min(err.abs());
                    v.yaw = wrap_deg(v.yaw + turn.copysign(err));
                }
            }
            Mode::Velocity(sp) => {
                v.vel = limit(sp.velocity, cfg.max_speed, cfg.climb_rate);
                let rate = sp.yaw_rate.clamp(-cfg.yaw_rate, cfg.yaw_rate);
                v.yaw = wrap_deg(v.yaw + rate * dt);
            }
        }

        let vel = v.vel;
        v.pos += vel * dt;

        if v.pos.z >= self.ground_z - GROUND_EPS {
            if v.pos.z > self.ground_z {
                v.pos.z = self.ground_z;
                v.vel.z = 0.0;
            }
            let was_in_air = v.in_air;
            v.in_air = false;
            if v.mode == Mode::Land || (was_in_air && !v.armed) {
                v.vel = Vec3::ZERO;
                v.armed = false;
                v.mode = Mode::Idle;
                if was_in_air {
                    info!("sim {}: landed, disarmed", self.name);
                }
            }
        } else if v.armed || v.in_air {
            v.in_air = true;
        }
    }

    fn publish(&self) {
        let (pos, vel, yaw, armed, in_air, mode) = {
            let v = lock(&self.vehicle);
            (v.pos, v.vel, v.yaw, v.armed, v.in_air, v.flight_mode())
        };
        let pos = if self.cfg.noise > 0.0 {
            let mut rng = lock(&self.rng);
            let n = self.cfg.noise;
            pos + Vec3::new(rng.gen_range(-n..n), rng.gen_range(-n..n), rng.gen_range(-n..n))
        } else {
            pos
        };
        self.telemetry.send_modify(|s| {
            s.seq += 1;
            s.ts_unix_ms = unix_ms_now();
            s.position = pos;
            s.velocity = vel;
            s.attitude.yaw = yaw;
            s.armed = armed;
            s.in_air = in_air;
            s.flight_mode = mode.to_string();
        });
    }
}

/// Separate horizontal and vertical speed limits.
fn limit(v: Vec3, horizontal: f64, vertical: f64) -> Vec3 {
    let h = Vec3::new(v.x, v.y, 0.0).clamp_norm(horizontal);
    Vec3::new(h.x, h.y, v.z.clamp(-vertical, vertical))
}

fn wrap_deg(deg: f64) -> f64 {
    heading_error_deg(0.0, deg)
}

async fn physics_loop(adapter: Weak<SimAdapter>, telemetry_hz: f64) {
    let (physics_hz, publish_every) = match adapter.upgrade() {
        Some(a) => (a.cfg.physics_hz.max(1.0), 1.0 / telemetry_hz.max(0.1)),
        None => return,
    };
    let dt = 1.0 / physics_hz;
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(dt));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut since_publish = f64::INFINITY;

    loop {
        ticker.tick().await;
        let Some(adapter) = adapter.upgrade() else { break };
        if adapter.closed.load(Ordering::Relaxed) {
            break;
        }
        adapter.step(dt);
        if adapter.severed.load(Ordering::Relaxed) {
            continue;
        }
        lock(&adapter.status).on_heartbeat();
        since_publish += dt;
        if since_publish + 1e-9 >= publish_every {
            since_publish = 0.0;
            adapter.publish();
        }
    }
}

#[async_trait]
impl ConnectionAdapter for SimAdapter {
    fn telemetry(&self) -> watch::Receiver<TelemetrySample> {
        self.telemetry.subscribe()
    }

    fn link_state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Relaxed) {
            return ConnectionState::Disconnected;
        }
        lock(&self.status).state(Duration::from_millis(self.cfg.link_timeout_ms))
    }

    async fn arm(&self) -> Result<(), AdapterError> {
        self.ack("arm").await?;
        if let Some(reason) = &self.cfg.deny_arm {
            return Err(AdapterError::denied("arm", reason.clone()));
        }
        lock(&self.vehicle).armed = true;
        self.accepted("arm");
        Ok(())
    }

    async fn disarm(&self) -> Result<(), AdapterError> {
        self.ack("disarm").await?;
        {
            let mut v = lock(&self.vehicle);
            if v.in_air {
                return Err(AdapterError::denied("disarm", "vehicle in air"));
            }
            v.armed = false;
            v.mode = Mode::Idle;
        }
        self.accepted("disarm");
        Ok(())
    }

    async fn kill(&self) -> Result<(), AdapterError> {
        self.ack("kill").await?;
        {
            let mut v = lock(&self.vehicle);
            v.armed = false;
            v.mode = Mode::Idle;
        }
        self.accepted("kill");
        Ok(())
    }

    async fn request_takeoff(&self, altitude: f64) -> Result<(), AdapterError> {
        self.ack("takeoff").await?;
        {
            let mut v = lock(&self.vehicle);
            if !v.armed {
                return Err(AdapterError::denied("takeoff", "not armed"));
            }
            v.mode = Mode::Takeoff { z: self.ground_z - altitude };
        }
        self.accepted("takeoff");
        Ok(())
    }

    async fn land(&self) -> Result<(), AdapterError> {
        self.ack("land").await?;
        {
            let mut v = lock(&self.vehicle);
            if !v.armed {
                return Err(AdapterError::denied("land", "not armed"));
            }
            v.mode = Mode::Land;
        }
        self.accepted("land");
        Ok(())
    }

    async fn set_flight_mode(&self, mode: &str) -> Result<(), AdapterError> {
        self.ack("mode").await?;
        let mode = mode.to_ascii_uppercase();
        {
            let mut v = lock(&self.vehicle);
            match mode.as_str() {
                "HOLD" => v.mode = Mode::Idle,
                "LAND" if v.armed => v.mode = Mode::Land,
                "OFFBOARD" if v.armed => {
                    if !matches!(v.mode, Mode::Position(_) | Mode::Velocity(_)) {
                        v.mode = Mode::Position(PositionSetpoint::at(v.pos, Some(v.yaw)));
                    }
                }
                "LAND" | "OFFBOARD" => return Err(AdapterError::denied("mode", "not armed")),
                _ => return Err(AdapterError::denied("mode", format!("{} is not simulated", mode))),
            }
        }
        self.accepted(&format!("mode {}", mode));
        Ok(())
    }

    async fn set_position_setpoint(&self, setpoint: &PositionSetpoint) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::Relaxed) || self.severed.load(Ordering::Relaxed) {
            return Err(AdapterError::Link("no route to vehicle".into()));
        }
        {
            let mut v = lock(&self.vehicle);
            if !v.armed {
                return Err(AdapterError::denied("position setpoint", "not armed"));
            }
            if !matches!(v.mode, Mode::Land | Mode::Takeoff { .. }) {
                v.mode = Mode::Position(*setpoint);
            }
        }
        lock(&self.position_log).push(*setpoint);
        Ok(())
    }

    async fn set_velocity_setpoint(&self, setpoint: &VelocitySetpoint) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::Relaxed) || self.severed.load(Ordering::Relaxed) {
            return Err(AdapterError::Link("no route to vehicle".into()));
        }
        {
            let mut v = lock(&self.vehicle);
            if !v.armed {
                return Err(AdapterError::denied("velocity setpoint", "not armed"));
            }
            if !matches!(v.mode, Mode::Land | Mode::Takeoff { .. }) {
                v.mode = Mode::Velocity(*setpoint);
            }
        }
        lock(&self.velocity_log).push(*setpoint);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        lock(&self.status).connected = false;
        info!("sim {}: closed", self.name);
    }
}

/// Hands out simulated vehicles, one per connection name.
#[derive(Default)]
pub struct SimConnector {
    defaults: SimConfig,
    overrides: HashMap<String, SimConfig>,
    vehicles: Mutex<HashMap<String, Arc<SimAdapter>>>,
}

impl SimConnector {
    pub fn new(defaults: SimConfig) -> Self {
        Self { defaults, ..Self::default() }
    }

    /// Per-vehicle configuration, e.g. a different start position.
    pub fn with_vehicle(mut self, name: &str, cfg: SimConfig) -> Self {
        self.overrides.insert(name.to_string(), cfg);
        self
    }

    /// The most recent vehicle connected under `name`.
    pub fn vehicle(&self, name: &str) -> Option<Arc<SimAdapter>> {
        lock(&self.vehicles).get(name).cloned()
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(
        &self,
        name: &str,
        address: &ConnectionAddress,
        telemetry_hz: f64,
    ) -> Result<Arc<dyn ConnectionAdapter>, AdapterError> {
        let cfg = self.overrides.get(name).cloned().unwrap_or_else(|| self.defaults.clone());
        if cfg.unreachable {
            debug!("sim {}: {} unreachable", name, address);
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(Duration::from_millis(cfg.connect_delay_ms)).await;
        let adapter = SimAdapter::new(name, cfg, telemetry_hz);
        lock(&self.vehicles).insert(name.to_string(), adapter.clone());
        info!("sim {}: connected at {}", name, address);
        Ok(adapter)
    }
}
