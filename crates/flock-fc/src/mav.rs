use anyhow::{Context, Result};
use async_trait::async_trait;
use flock_proto::{
    unix_ms_now, ConnectionState, PositionSetpoint, TelemetrySample, Vec3, VelocitySetpoint,
};
use mavlink::{
    common::{
        MavAutopilot, MavCmd, MavFrame, MavLandedState, MavMessage, MavModeFlag, MavResult,
        MavState, MavType, PositionTargetTypemask, COMMAND_LONG_DATA, HEARTBEAT_DATA,
        SET_POSITION_TARGET_LOCAL_NED_DATA,
    },
    error::MessageReadError,
    MavConnection, MavHeader,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, ConnectionAdapter, Connector};
use crate::address::{ConnectionAddress, Scheme};
use crate::safety::CommandRateLimit;
use crate::state::LinkStatus;
use crate::udp::UdpLink;
use crate::{lock, LinkConfig};

type Conn = dyn MavConnection<MavMessage> + Sync + Send;

const MSG_ID_ATTITUDE: f32 = 30.0;
const MSG_ID_LOCAL_POSITION_NED: f32 = 32.0;
const MSG_ID_GLOBAL_POSITION_INT: f32 = 33.0;
const MSG_ID_HOME_POSITION: f32 = 242.0;
const MSG_ID_EXTENDED_SYS_STATE: f32 = 245.0;

/// PX4 main mode number for offboard control.
const PX4_MAIN_MODE_OFFBOARD: f32 = 6.0;
/// Magic param2 of MAV_CMD_COMPONENT_ARM_DISARM that forces a disarm in flight.
const FORCE_DISARM: f32 = 21196.0;
/// PX4 refuses offboard mode unless setpoints are already streaming.
const OFFBOARD_PRIME_SETPOINTS: u32 = 5;

/// State written by the reader thread and read by the async side.
struct Shared {
    telemetry: watch::Sender<TelemetrySample>,
    status: Mutex<LinkStatus>,
    acks: Mutex<HashMap<u32, oneshot::Sender<MavResult>>>,
    ground_amsl: Mutex<Option<f64>>,
    heartbeat_seen: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Shared {
    fn publish(&self, f: impl FnOnce(&mut TelemetrySample)) {
        self.telemetry.send_modify(|s| {
            f(s);
            s.seq += 1;
            s.ts_unix_ms = unix_ms_now();
        });
    }

    fn handle(&self, hdr: &MavHeader, msg: MavMessage, target_comp: u8) {
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                if hdr.component_id != target_comp || matches!(hb.mavtype, MavType::MAV_TYPE_GCS) {
                    return;
                }
                lock(&self.status).on_heartbeat();
                self.heartbeat_seen.send_replace(true);
                let armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                let mode = px4_mode_name(hb.custom_mode);
                self.publish(|s| {
                    s.armed = armed;
                    s.flight_mode = mode;
                });
            }
            MavMessage::LOCAL_POSITION_NED(p) => self.publish(|s| {
                s.position = Vec3::new(p.x as f64, p.y as f64, p.z as f64);
                s.velocity = Vec3::new(p.vx as f64, p.vy as f64, p.vz as f64);
            }),
            MavMessage::ATTITUDE(a) => self.publish(|s| {
                s.attitude.roll = (a.roll as f64).to_degrees();
                s.attitude.pitch = (a.pitch as f64).to_degrees();
                s.attitude.yaw = (a.yaw as f64).to_degrees();
            }),
            MavMessage::EXTENDED_SYS_STATE(st) => {
                let in_air = matches!(
                    st.landed_state,
                    MavLandedState::MAV_LANDED_STATE_IN_AIR
                        | MavLandedState::MAV_LANDED_STATE_TAKEOFF
                        | MavLandedState::MAV_LANDED_STATE_LANDING
                );
                self.publish(|s| s.in_air = in_air);
            }
            MavMessage::GLOBAL_POSITION_INT(g) => {
                // alt and relative_alt are in millimeters
                *lock(&self.ground_amsl) = Some((g.alt - g.relative_alt) as f64 / 1000.0);
            }
            MavMessage::HOME_POSITION(h) => self.publish(|s| {
                s.home = Some(Vec3::new(h.x as f64, h.y as f64, h.z as f64));
            }),
            MavMessage::COMMAND_ACK(ack) => {
                if matches!(ack.result, MavResult::MAV_RESULT_IN_PROGRESS) {
                    return;
                }
                if let Some(tx) = lock(&self.acks).remove(&(ack.command as u32)) {
                    let _ = tx.send(ack.result);
                }
            }
            MavMessage::STATUSTEXT(t) => {
                let text: String = t.text.iter().take_while(|b| **b != 0).map(|b| *b as char).collect();
                info!("fc: {}", text);
                lock(&self.status).last_msg = Some(text);
            }
            _ => {}
        }
    }
}

pub struct MavlinkAdapter {
    name: String,
    /// Taken on close so the socket or device is released.
    conn: Mutex<Option<Arc<Conn>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    hdr: Mutex<MavHeader>,
    cfg: LinkConfig,
    shared: Arc<Shared>,
    limiter: Mutex<CommandRateLimit>,
    streamed: AtomicU32,
    boot: Instant,
}

impl MavlinkAdapter {
    /// Opens the link, starts the reader thread and the companion heartbeat and
    /// returns once the flight controller's first heartbeat arrived.
    pub async fn open(
        name: &str,
        address: &ConnectionAddress,
        cfg: LinkConfig,
        telemetry_hz: f64,
    ) -> Result<Arc<Self>> {
        let url = address
            .to_mavlink_url()
            .with_context(|| format!("{} is not a MAVLink address", address))?;

        if address.scheme == Scheme::Serial {
            // quick validate device
            let _ = tokio_serial::new(&address.host, address.port)
                .open_native_async()
                .with_context(|| format!("open fc serial device {}", address.host))?;
        }

        let connect_url = url.clone();
        let scheme = address.scheme;
        let endpoint = format!("{}:{}", address.host, address.port);
        let conn = tokio::task::spawn_blocking(move || -> io::Result<Box<Conn>> {
            match scheme {
                Scheme::UdpIn => Ok(Box::new(UdpLink::listen(&endpoint)?)),
                Scheme::UdpOut => Ok(Box::new(UdpLink::dial(&endpoint)?)),
                _ => mavlink::connect::<MavMessage>(&connect_url),
            }
        })
        .await
        .context("mavlink connect task")?
        .with_context(|| format!("mavlink connect {}", url))?;
        let conn: Arc<Conn> = Arc::from(conn);

        let (telemetry, _) = watch::channel(TelemetrySample::default());
        let (heartbeat_seen, mut hb_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            telemetry,
            status: Mutex::new(LinkStatus::new(address.as_str())),
            acks: Mutex::new(HashMap::new()),
            ground_amsl: Mutex::new(None),
            heartbeat_seen,
            closed: AtomicBool::new(false),
        });

        // Reader loop in a dedicated thread (mavlink recv blocks). It only holds
        // the shared state weakly, so dropping an unfinished open stops it too.
        let reader = {
            let conn = conn.clone();
            let shared = Arc::downgrade(&shared);
            let (target_sys, target_comp) = (cfg.target_sys, cfg.target_comp);
            std::thread::Builder::new()
                .name(format!("mav-rx-{}", name))
                .spawn(move || reader_loop(conn, shared, target_sys, target_comp))
                .context("spawn mavlink reader thread")?
        };

        let adapter = Arc::new(Self {
            name: name.to_string(),
            conn: Mutex::new(Some(conn)),
            reader: Mutex::new(Some(reader)),
            hdr: Mutex::new(MavHeader { system_id: cfg.sys_id, component_id: cfg.comp_id, sequence: 0 }),
            cfg,
            shared,
            limiter: Mutex::new(CommandRateLimit::new(Duration::from_secs(1))),
            streamed: AtomicU32::new(0),
            boot: Instant::now(),
        });

        tokio::spawn(heartbeat_loop(Arc::downgrade(&adapter), adapter.cfg.heartbeat_interval()));

        if adapter.cfg.require_heartbeat {
            while !*hb_rx.borrow_and_update() {
                hb_rx.changed().await.context("mavlink reader stopped")?;
            }
        }
        info!("fc {}: heartbeat from {} (sys {})", name, address, adapter.cfg.target_sys);

        adapter.request_telemetry(telemetry_hz).await;
        Ok(adapter)
    }

    /// Asks the flight controller to stream the messages we consume at `hz`.
    async fn request_telemetry(&self, hz: f64) {
        let interval_us = (1_000_000.0 / hz.max(0.1)) as f32;
        for msg_id in [
            MSG_ID_LOCAL_POSITION_NED,
            MSG_ID_ATTITUDE,
            MSG_ID_EXTENDED_SYS_STATE,
            MSG_ID_GLOBAL_POSITION_INT,
        ] {
            if let Err(e) = self
                .command_long(MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL, [msg_id, interval_us, 0.0, 0.0, 0.0, 0.0, 0.0])
                .await
            {
                warn!("fc {}: message interval for id {} not set: {}", self.name, msg_id, e);
            }
        }
        // home rarely changes, 1 Hz is plenty
        let _ = self
            .command_long(MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL, [MSG_ID_HOME_POSITION, 1_000_000.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .await;
    }

    pub fn link_status(&self) -> LinkStatus {
        lock(&self.shared.status).clone()
    }

    fn send(&self, msg: MavMessage) -> Result<(), AdapterError> {
        let hdr = {
            let mut h = lock(&self.hdr);
            h.sequence = h.sequence.wrapping_add(1);
            h.clone()
        };
        let conn = lock(&self.conn).clone().ok_or_else(|| AdapterError::Link("link closed".into()))?;
        conn.send(&hdr, &msg)
            .map(|_| ())
            .map_err(|e| AdapterError::Link(format!("mavlink send: {:?}", e)))
    }

    fn send_heartbeat(&self) -> Result<(), AdapterError> {
        let hb = HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_GCS,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        };
        self.send(MavMessage::HEARTBEAT(hb))
    }

    fn command_data(&self, command: MavCmd, p: [f32; 7]) -> COMMAND_LONG_DATA {
        COMMAND_LONG_DATA {
            target_system: self.cfg.target_sys,
            target_component: self.cfg.target_comp,
            command,
            confirmation: 0,
            param1: p[0],
            param2: p[1],
            param3: p[2],
            param4: p[3],
            param5: p[4],
            param6: p[5],
            param7: p[6],
        }
    }

    /// Sends a COMMAND_LONG and waits for the matching COMMAND_ACK.
    async fn command_long(&self, command: MavCmd, params: [f32; 7]) -> Result<(), AdapterError> {
        let key = command as u32;
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.acks).insert(key, tx);

        if let Err(e) = self.send(MavMessage::COMMAND_LONG(self.command_data(command, params))) {
            lock(&self.shared.acks).remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(self.cfg.ack_timeout(), rx).await {
            Ok(Ok(MavResult::MAV_RESULT_ACCEPTED)) => Ok(()),
            Ok(Ok(result)) => Err(AdapterError::Denied {
                command: format!("{:?}", command),
                reason: format!("{:?}", result),
            }),
            Ok(Err(_)) => Err(AdapterError::Link("acknowledgment channel closed".into())),
            Err(_) => {
                lock(&self.shared.acks).remove(&key);
                Err(AdapterError::Timeout {
                    command: format!("{:?}", command),
                    timeout_ms: self.cfg.ack_timeout_ms,
                })
            }
        }
    }

    fn boot_ms(&self) -> u32 {
        self.boot.elapsed().as_millis() as u32
    }

    fn ensure_link(&self) -> Result<(), AdapterError> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(AdapterError::Link("link closed".into()));
        }
        Ok(())
    }

    /// Takeoff and land switch the FC out of offboard; streaming starts over.
    fn leave_offboard(&self) {
        self.streamed.store(0, Ordering::Relaxed);
        lock(&self.limiter).reset("offboard");
    }

    /// Switches to offboard once enough setpoints have been streamed.
    fn maybe_engage_offboard(&self) {
        let streamed = self.streamed.fetch_add(1, Ordering::Relaxed) + 1;
        if streamed < OFFBOARD_PRIME_SETPOINTS {
            return;
        }
        if self.shared.telemetry.borrow().flight_mode == "OFFBOARD" {
            return;
        }
        if !lock(&self.limiter).allow("offboard") {
            return;
        }
        info!("fc {}: requesting OFFBOARD mode", self.name);
        let custom = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32;
        let cmd = self.command_data(MavCmd::MAV_CMD_DO_SET_MODE, [custom, PX4_MAIN_MODE_OFFBOARD, 0.0, 0.0, 0.0, 0.0, 0.0]);
        if let Err(e) = self.send(MavMessage::COMMAND_LONG(cmd)) {
            warn!("fc {}: offboard request failed: {}", self.name, e);
        }
    }

    fn position_target(&self, sp: &PositionSetpoint) -> SET_POSITION_TARGET_LOCAL_NED_DATA {
        let mut mask = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE;
        let vel = sp.velocity.unwrap_or_else(|| {
            mask |= PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VX_IGNORE
                | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VY_IGNORE
                | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VZ_IGNORE;
            Vec3::ZERO
        });
        let acc = sp.acceleration.unwrap_or_else(|| {
            mask |= PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
                | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
                | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE;
            Vec3::ZERO
        });
        let yaw = match sp.yaw {
            Some(deg) => deg.to_radians() as f32,
            None => {
                mask |= PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE;
                0.0
            }
        };
        SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: self.boot_ms(),
            x: sp.position.x as f32,
            y: sp.position.y as f32,
            z: sp.position.z as f32,
            vx: vel.x as f32,
            vy: vel.y as f32,
            vz: vel.z as f32,
            afx: acc.x as f32,
            afy: acc.y as f32,
            afz: acc.z as f32,
            yaw,
            yaw_rate: 0.0,
            type_mask: mask,
            target_system: self.cfg.target_sys,
            target_component: self.cfg.target_comp,
            coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
        }
    }

    fn velocity_target(&self, sp: &VelocitySetpoint) -> SET_POSITION_TARGET_LOCAL_NED_DATA {
        let mask = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_X_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Y_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Z_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE;
        SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: self.boot_ms(),
            x: 0.0,
            y: 0.0,
            z: 0.0,
            vx: sp.velocity.x as f32,
            vy: sp.velocity.y as f32,
            vz: sp.velocity.z as f32,
            afx: 0.0,
            afy: 0.0,
            afz: 0.0,
            yaw: 0.0,
            yaw_rate: sp.yaw_rate.to_radians() as f32,
            type_mask: mask,
            target_system: self.cfg.target_sys,
            target_component: self.cfg.target_comp,
            coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
        }
    }
}

#[async_trait]
impl ConnectionAdapter for MavlinkAdapter {
    fn telemetry(&self) -> watch::Receiver<TelemetrySample> {
        self.shared.telemetry.subscribe()
    }

    fn link_state(&self) -> ConnectionState {
        if self.shared.closed.load(Ordering::Relaxed) {
            return ConnectionState::Disconnected;
        }
        lock(&self.shared.status).state(self.cfg.link_timeout())
    }

    async fn arm(&self) -> Result<(), AdapterError> {
        self.ensure_link()?;
        info!("fc {}: sending ARM", self.name);
        self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).await
    }

    async fn disarm(&self) -> Result<(), AdapterError> {
        self.ensure_link()?;
        info!("fc {}: sending DISARM", self.name);
        self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).await
    }

    async fn kill(&self) -> Result<(), AdapterError> {
        self.ensure_link()?;
        warn!("fc {}: sending forced DISARM", self.name);
        self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0, FORCE_DISARM, 0.0, 0.0, 0.0, 0.0, 0.0]).await
    }

    async fn request_takeoff(&self, altitude: f64) -> Result<(), AdapterError> {
        self.ensure_link()?;
        // param7 is AMSL; without a ground reference the FC uses its default takeoff altitude
        let amsl = lock(&self.shared.ground_amsl).map(|g| (g + altitude) as f32).unwrap_or(f32::NAN);
        info!("fc {}: sending TAKEOFF to {:.1} m (amsl {})", self.name, altitude, amsl);
        self.leave_offboard();
        self.command_long(MavCmd::MAV_CMD_NAV_TAKEOFF, [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, amsl]).await
    }

    async fn land(&self) -> Result<(), AdapterError> {
        self.ensure_link()?;
        info!("fc {}: sending LAND", self.name);
        self.leave_offboard();
        self.command_long(MavCmd::MAV_CMD_NAV_LAND, [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, f32::NAN]).await
    }

    async fn set_flight_mode(&self, mode: &str) -> Result<(), AdapterError> {
        self.ensure_link()?;
        let Some((main, sub)) = px4_custom_mode(mode) else {
            return Err(AdapterError::denied("mode", format!("unknown flight mode {}", mode)));
        };
        info!("fc {}: sending mode {}", self.name, mode.to_ascii_uppercase());
        self.leave_offboard();
        let custom = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32;
        self.command_long(MavCmd::MAV_CMD_DO_SET_MODE, [custom, main, sub, 0.0, 0.0, 0.0, 0.0]).await
    }

    async fn set_position_setpoint(&self, setpoint: &PositionSetpoint) -> Result<(), AdapterError> {
        self.ensure_link()?;
        self.send(MavMessage::SET_POSITION_TARGET_LOCAL_NED(self.position_target(setpoint)))?;
        self.maybe_engage_offboard();
        Ok(())
    }

    async fn set_velocity_setpoint(&self, setpoint: &VelocitySetpoint) -> Result<(), AdapterError> {
        self.ensure_link()?;
        self.send(MavMessage::SET_POSITION_TARGET_LOCAL_NED(self.velocity_target(setpoint)))?;
        self.maybe_engage_offboard();
        Ok(())
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        lock(&self.shared.status).connected = false;
        lock(&self.conn).take();
        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            // the reader notices within one receive timeout and drops its handle
            if tokio::task::spawn_blocking(move || reader.join()).await.is_err() {
                warn!("fc {}: reader thread did not stop cleanly", self.name);
            }
        }
        info!("fc {}: link closed", self.name);
    }
}

fn reader_loop(conn: Arc<Conn>, shared: Weak<Shared>, target_sys: u8, target_comp: u8) {
    loop {
        let received = conn.recv();
        let Some(shared) = shared.upgrade() else { break };
        if shared.closed.load(Ordering::Relaxed) {
            break;
        }
        match received {
            Ok((hdr, msg)) => {
                if hdr.system_id != target_sys {
                    continue;
                }
                shared.handle(&hdr, msg, target_comp);
            }
            Err(MessageReadError::Io(e)) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                debug!("fc: recv failed: {:?}", e);
                // Light sleep to avoid busy loop on a dead serial port
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
    debug!("fc: reader stopped");
}

async fn heartbeat_loop(adapter: Weak<MavlinkAdapter>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(adapter) = adapter.upgrade() else { break };
        if adapter.shared.closed.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = adapter.send_heartbeat() {
            warn!("fc {}: heartbeat send failed: {}", adapter.name, e);
        }
    }
}

/// Decodes the PX4 custom mode carried in HEARTBEAT.
pub fn px4_mode_name(custom_mode: u32) -> String {
    let main = (custom_mode >> 16) & 0xff;
    let sub = (custom_mode >> 24) & 0xff;
    let name = match (main, sub) {
        (1, _) => "MANUAL",
        (2, _) => "ALTCTL",
        (3, _) => "POSCTL",
        (4, 2) => "TAKEOFF",
        (4, 3) => "HOLD",
        (4, 4) => "MISSION",
        (4, 5) => "RTL",
        (4, 6) => "LAND",
        (4, _) => "AUTO",
        (5, _) => "ACRO",
        (6, _) => "OFFBOARD",
        (7, _) => "STABILIZED",
        (8, _) => "RATTITUDE",
        _ => "UNKNOWN",
    };
    name.to_string()
}

/// PX4 main and sub mode for DO_SET_MODE, from a name as [`px4_mode_name`] prints it.
pub fn px4_custom_mode(name: &str) -> Option<(f32, f32)> {
    let mode = match name.to_ascii_uppercase().as_str() {
        "MANUAL" => (1, 0),
        "ALTCTL" => (2, 0),
        "POSCTL" => (3, 0),
        "TAKEOFF" => (4, 2),
        "HOLD" => (4, 3),
        "MISSION" => (4, 4),
        "RTL" => (4, 5),
        "LAND" => (4, 6),
        "ACRO" => (5, 0),
        "OFFBOARD" => (6, 0),
        "STABILIZED" => (7, 0),
        "RATTITUDE" => (8, 0),
        _ => return None,
    };
    Some((mode.0 as f32, mode.1 as f32))
}

pub struct MavlinkConnector {
    link: LinkConfig,
}

impl MavlinkConnector {
    pub fn new(link: LinkConfig) -> Self {
        Self { link }
    }
}

#[async_trait]
impl Connector for MavlinkConnector {
    async fn connect(
        &self,
        name: &str,
        address: &ConnectionAddress,
        telemetry_hz: f64,
    ) -> Result<Arc<dyn ConnectionAdapter>, AdapterError> {
        let adapter = MavlinkAdapter::open(name, address, self.link.clone(), telemetry_hz)
            .await
            .map_err(|e| AdapterError::Link(format!("{:#}", e)))?;
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::udp::RECV_POLL;

    fn quiet_link(require_heartbeat: bool) -> LinkConfig {
        LinkConfig { require_heartbeat, ack_timeout_ms: 20, ..LinkConfig::default() }
    }

    #[tokio::test]
    async fn listening_port_is_released_on_close_and_abandoned_connect() {
        let port = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let address = ConnectionAddress::parse(&format!("udpin://127.0.0.1:{}", port)).unwrap();

        // no vehicle ever sends a heartbeat; the caller gives up
        let pending = MavlinkAdapter::open("a", &address, quiet_link(true), 10.0);
        assert!(tokio::time::timeout(Duration::from_millis(200), pending).await.is_err());
        tokio::time::sleep(RECV_POLL * 3).await;

        let adapter = MavlinkAdapter::open("a", &address, quiet_link(false), 10.0).await.unwrap();
        adapter.close().await;
        assert_eq!(adapter.link_state(), ConnectionState::Disconnected);
        assert!(adapter.arm().await.is_err());

        // bound again right after close returns, with the old adapter still alive
        let again = MavlinkAdapter::open("a", &address, quiet_link(false), 10.0).await.unwrap();
        again.close().await;
    }

    #[test]
    fn decodes_px4_modes() {
        assert_eq!(px4_mode_name(6 << 16), "OFFBOARD");
        assert_eq!(px4_mode_name((4 << 16) | (6 << 24)), "LAND");
        assert_eq!(px4_mode_name((4 << 16) | (3 << 24)), "HOLD");
        assert_eq!(px4_mode_name(3 << 16), "POSCTL");
        assert_eq!(px4_mode_name(0), "UNKNOWN");
    }

    #[test]
    fn mode_names_encode_back() {
        for name in ["POSCTL", "HOLD", "LAND", "RTL", "OFFBOARD"] {
            let (main, sub) = px4_custom_mode(name).unwrap();
            let custom = ((main as u32) << 16) | ((sub as u32) << 24);
            assert_eq!(px4_mode_name(custom), name);
        }
        assert_eq!(px4_custom_mode("hold"), Some((4.0, 3.0)));
        assert_eq!(px4_custom_mode("cruise"), None);
    }

    #[tokio::test]
    async fn unknown_mode_is_denied_locally() {
        let port = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let address = ConnectionAddress::parse(&format!("udpin://127.0.0.1:{}", port)).unwrap();
        let adapter = MavlinkAdapter::open("a", &address, quiet_link(false), 10.0).await.unwrap();
        let err = adapter.set_flight_mode("cruise").await.unwrap_err();
        assert!(matches!(err, AdapterError::Denied { .. }));
        adapter.close().await;
    }
}
