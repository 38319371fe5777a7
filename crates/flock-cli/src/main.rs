use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use flock_fc::{ConnectionAddress, Connector, LinkConfig, MavlinkConnector, SimConfig, SimConnector};
use flock_fleet::{Command, CommandHandle, CommandReport, DroneConfig, DroneStatus, FleetManager};
use flock_nav::{doctor as nav_doctor, AxisLimits, FenceConfig, FenceMode, KinematicLimits};
use flock_proto::{CommandSpec, EventKind, FleetEvent, Vec3};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

#[derive(Debug, Parser)]
#[command(name = "flock", version, about = "flock - command scheduling and navigation for drone fleets")]
struct Cli {
    #[arg(long)]
    config: Option<String>,

    /// Fly simulated vehicles instead of opening MAVLink links.
    #[arg(long)]
    sim: bool,

    /// Print events, command reports and status as JSON lines.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Validate the configuration without connecting to anything.
    Doctor,
    /// Read fleet commands line by line from stdin or a script.
    Shell {
        #[arg(long)]
        script: Option<String>,
    },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    link: LinkConfig,
    drone: DroneConfig,
    sim: SimConfig,
    /// Connected when the shell starts, name -> connection string.
    drones: BTreeMap<String, String>,
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let Some(path) = path else { return Ok(Config::default()) };
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Cmd::Doctor => doctor(&cfg)?,
        Cmd::Shell { script } => shell(&cfg, cli.sim, cli.json, script.as_deref()).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    nav_doctor::check_limits(&cfg.drone.limits)?;
    nav_doctor::check_nav(&cfg.drone.nav)?;
    if let Some(fence) = &cfg.drone.fence {
        nav_doctor::check_fence(fence)?;
    } else {
        warn!("doctor: no fence configured");
    }

    let d = &cfg.drone;
    anyhow::ensure!(d.telemetry_hz > 0.0 && d.telemetry_hz <= 100.0, "drone.telemetry_hz should be in (0, 100]");
    anyhow::ensure!(d.control_hz >= 1.0 && d.control_hz <= 100.0, "drone.control_hz should be in [1, 100]");
    anyhow::ensure!(d.connect_timeout_s > 0.0, "drone.connect_timeout_s must be positive");
    anyhow::ensure!(d.debounce_s >= 0.0, "drone.debounce_s must not be negative");

    anyhow::ensure!(cfg.link.sys_id != 0, "link.sys_id must be non-zero");
    anyhow::ensure!(cfg.link.ack_timeout_ms > 0, "link.ack_timeout_ms must be positive");
    anyhow::ensure!(cfg.link.link_timeout_ms > 0, "link.link_timeout_ms must be positive");

    let mut seen: Vec<(&str, ConnectionAddress)> = Vec::new();
    for (name, address) in &cfg.drones {
        let parsed = ConnectionAddress::parse(address).with_context(|| format!("drones.{}", name))?;
        if let Some((other, _)) = seen.iter().find(|(_, a)| a.same_endpoint(&parsed)) {
            anyhow::bail!("drones.{} and drones.{} share the address {}", other, name, address);
        }
        seen.push((name.as_str(), parsed));
    }

    info!("doctor: OK ({} drones)", cfg.drones.len());
    Ok(())
}

// --- shell ---

#[derive(Debug, Parser)]
#[command(name = "flock>", no_binary_name = true)]
struct ShellLine {
    #[command(subcommand)]
    cmd: ShellCmd,
}

#[derive(Debug, Args)]
struct Target {
    /// Drone to address, may be repeated. All drones when omitted.
    #[arg(short, long = "drone")]
    drones: Vec<String>,

    /// Queue behind the current command instead of superseding it.
    #[arg(short, long)]
    queue: bool,

    /// Fail the command when it runs longer than this many seconds.
    #[arg(long)]
    watchdog: Option<f64>,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "kebab-case")]
enum ShellCmd {
    Connect {
        name: String,
        address: String,
    },
    Disconnect {
        name: String,
        /// Disconnect even while armed or flying.
        #[arg(long)]
        force: bool,
    },
    Arm {
        #[command(flatten)]
        target: Target,
    },
    Disarm {
        #[command(flatten)]
        target: Target,
    },
    Takeoff {
        altitude: f64,
        #[command(flatten)]
        target: Target,
    },
    Land {
        #[command(flatten)]
        target: Target,
    },
    /// Fly to a local NED position.
    #[command(allow_negative_numbers = true)]
    Flyto {
        north: f64,
        east: f64,
        down: f64,
        #[arg(long)]
        yaw: Option<f64>,
        #[arg(long)]
        tolerance: Option<f64>,
        #[command(flatten)]
        target: Target,
    },
    /// Follow waypoints, each given as `--wp north,east,down`.
    Path {
        #[arg(short = 'w', long = "wp", required = true, allow_hyphen_values = true, value_parser = parse_vec3)]
        waypoints: Vec<Vec3>,
        #[arg(long)]
        yaw: Option<f64>,
        #[arg(long)]
        tolerance: Option<f64>,
        #[command(flatten)]
        target: Target,
    },
    /// Replace the remaining waypoints of a running path.
    UpdatePath {
        name: String,
        #[arg(short = 'w', long = "wp", required = true, allow_hyphen_values = true, value_parser = parse_vec3)]
        waypoints: Vec<Vec3>,
    },
    /// Move by a NED offset from the current position.
    #[command(allow_negative_numbers = true)]
    Move {
        north: f64,
        east: f64,
        down: f64,
        #[arg(long)]
        yaw: Option<f64>,
        #[arg(long)]
        tolerance: Option<f64>,
        #[command(flatten)]
        target: Target,
    },
    #[command(allow_negative_numbers = true)]
    Yaw {
        heading: f64,
        /// Heading tolerance in degrees.
        #[arg(long)]
        tolerance: Option<f64>,
        #[command(flatten)]
        target: Target,
    },
    #[command(allow_negative_numbers = true)]
    Velocity {
        north: f64,
        east: f64,
        down: f64,
        seconds: f64,
        #[arg(long, default_value_t = 0.0)]
        yaw_rate: f64,
        #[command(flatten)]
        target: Target,
    },
    Wait {
        seconds: f64,
        #[command(flatten)]
        target: Target,
    },
    /// Switch the autopilot flight mode, e.g. `mode hold`.
    Mode {
        mode: String,
        #[command(flatten)]
        target: Target,
    },
    /// Freeze task execution and hold position.
    Pause {
        names: Vec<String>,
    },
    Resume {
        names: Vec<String>,
    },
    /// Set or clear the geofence, e.g. `fence --north -5 5 --east -5 5 --down -10 0`.
    #[command(allow_negative_numbers = true)]
    Fence {
        #[arg(long, num_args = 2)]
        north: Option<Vec<f64>>,
        #[arg(long, num_args = 2)]
        east: Option<Vec<f64>>,
        #[arg(long, num_args = 2)]
        down: Option<Vec<f64>>,
        /// reject or clip
        #[arg(long, default_value = "reject")]
        mode: String,
        #[arg(long, default_value_t = 0.0)]
        vehicle_size: f64,
        #[arg(long, default_value_t = 0.0)]
        margin: f64,
        #[arg(long)]
        off: bool,
        #[arg(short, long = "drone")]
        drones: Vec<String>,
    },
    /// Kinematic limits as `velocity acceleration jerk`.
    Limits {
        #[arg(long, num_args = 3)]
        horizontal: Option<Vec<f64>>,
        #[arg(long, num_args = 3)]
        vertical: Option<Vec<f64>>,
        #[arg(short, long = "drone")]
        drones: Vec<String>,
    },
    Status {
        names: Vec<String>,
    },
    /// Land, superseding everything queued.
    Stop {
        names: Vec<String>,
    },
    /// Forced disarm. The vehicle falls if airborne.
    Kill {
        names: Vec<String>,
    },
    /// Wait until every submitted command has finished.
    Sync,
    Quit,
}

fn parse_vec3(s: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("expected north,east,down, got {:?}", s));
    }
    let mut v = [0.0; 3];
    for (slot, part) in v.iter_mut().zip(&parts) {
        *slot = part.trim().parse::<f64>().map_err(|e| format!("{}: {}", part, e))?;
    }
    Ok(Vec3::from_array(v))
}

enum Flow {
    Continue,
    Quit,
}

struct Shell {
    fleet: Arc<FleetManager>,
    json: bool,
    pending: Vec<(String, CommandHandle)>,
}

async fn shell(cfg: &Config, sim: bool, json: bool, script: Option<&str>) -> Result<()> {
    let connector: Arc<dyn Connector> = if sim {
        info!("shell: simulated flight controllers");
        Arc::new(SimConnector::new(cfg.sim.clone()))
    } else {
        Arc::new(MavlinkConnector::new(cfg.link.clone()))
    };
    let fleet = Arc::new(FleetManager::new(connector, cfg.drone.clone()));
    let printer = tokio::spawn(print_events(fleet.subscribe(), json));

    for (name, address) in &cfg.drones {
        if let Err(e) = fleet.connect(name, address, None).await {
            warn!("shell: {:#}", anyhow::Error::from(e));
        }
    }

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match script {
        Some(path) => {
            let f = tokio::fs::File::open(path).await.with_context(|| format!("open script {}", path))?;
            Box::new(BufReader::new(f))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut lines = input.lines();
    let mut sh = Shell { fleet: fleet.clone(), json, pending: Vec::new() };

    while let Some(line) = lines.next_line().await.context("read shell input")? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = match ShellLine::try_parse_from(line.split_whitespace()) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        match sh.execute(parsed.cmd).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => warn!("shell: {:#}", e),
        }
    }

    sh.sync().await;
    fleet.close().await;
    printer.abort();
    Ok(())
}

impl Shell {
    async fn execute(&mut self, cmd: ShellCmd) -> Result<Flow> {
        let nav = self.fleet.defaults().nav.clone();
        match cmd {
            ShellCmd::Connect { name, address } => {
                self.fleet.connect(&name, &address, None).await?;
            }
            ShellCmd::Disconnect { name, force } => self.fleet.disconnect(&name, force).await?,
            ShellCmd::Arm { target } => self.submit(&target, CommandSpec::Arm)?,
            ShellCmd::Disarm { target } => self.submit(&target, CommandSpec::Disarm)?,
            ShellCmd::Takeoff { altitude, target } => {
                anyhow::ensure!(altitude > 0.0, "takeoff altitude must be positive");
                self.submit(&target, CommandSpec::Takeoff { altitude })?
            }
            ShellCmd::Land { target } => self.submit(&target, CommandSpec::Land)?,
            ShellCmd::Flyto { north, east, down, yaw, tolerance, target } => {
                let spec = CommandSpec::fly_to(Vec3::new(north, east, down), yaw, tolerance.unwrap_or(nav.tolerance));
                self.submit(&target, spec)?
            }
            ShellCmd::Path { waypoints, yaw, tolerance, target } => {
                let spec = CommandSpec::FollowPath { waypoints, yaw, tolerance: tolerance.unwrap_or(nav.tolerance) };
                self.submit(&target, spec)?
            }
            ShellCmd::UpdatePath { name, waypoints } => {
                let drone = self.fleet.get(&name).with_context(|| format!("unknown drone {}", name))?;
                drone.update_path(waypoints)?;
            }
            ShellCmd::Move { north, east, down, yaw, tolerance, target } => {
                let spec = CommandSpec::Move {
                    offset: Vec3::new(north, east, down),
                    yaw,
                    tolerance: tolerance.unwrap_or(nav.tolerance),
                };
                self.submit(&target, spec)?
            }
            ShellCmd::Yaw { heading, tolerance, target } => {
                let spec = CommandSpec::Yaw { yaw: heading, tolerance: tolerance.unwrap_or(nav.yaw_tolerance) };
                self.submit(&target, spec)?
            }
            ShellCmd::Velocity { north, east, down, seconds, yaw_rate, target } => {
                anyhow::ensure!(seconds.is_finite() && seconds >= 0.0, "duration must be a non-negative number of seconds");
                let spec = CommandSpec::Velocity { velocity: Vec3::new(north, east, down), yaw_rate, seconds };
                self.submit(&target, spec)?
            }
            ShellCmd::Wait { seconds, target } => {
                anyhow::ensure!(seconds.is_finite() && seconds >= 0.0, "duration must be a non-negative number of seconds");
                self.submit(&target, CommandSpec::Wait { seconds })?
            }
            ShellCmd::Mode { mode, target } => self.submit(&target, CommandSpec::FlightMode { mode })?,
            ShellCmd::Pause { names } => self.fleet.pause(&names)?,
            ShellCmd::Resume { names } => self.fleet.resume(&names)?,
            ShellCmd::Fence { north, east, down, mode, vehicle_size, margin, off, drones } => {
                if off {
                    self.fleet.set_fence(&drones, None)?;
                } else {
                    let mode = match mode.as_str() {
                        "reject" => FenceMode::Reject,
                        "clip" => FenceMode::Clip,
                        other => anyhow::bail!("unknown fence mode {}", other),
                    };
                    let bounds = |name: &str, v: Option<Vec<f64>>| -> Result<[f64; 2]> {
                        match v.as_deref() {
                            Some([min, max]) => Ok([*min, *max]),
                            _ => anyhow::bail!("--{} MIN MAX is required", name),
                        }
                    };
                    let fence = FenceConfig {
                        north: bounds("north", north)?,
                        east: bounds("east", east)?,
                        down: bounds("down", down)?,
                        vehicle_size,
                        safety_margin: margin,
                        mode,
                    };
                    self.fleet.set_fence(&drones, Some(&fence))?;
                }
            }
            ShellCmd::Limits { horizontal, vertical, drones } => {
                let defaults = self.fleet.defaults().limits;
                let axis = |v: Option<Vec<f64>>, fallback: AxisLimits| match v.as_deref() {
                    Some([velocity, acceleration, jerk]) => {
                        AxisLimits { velocity: *velocity, acceleration: *acceleration, jerk: *jerk }
                    }
                    _ => fallback,
                };
                let limits = KinematicLimits {
                    horizontal: axis(horizontal, defaults.horizontal),
                    vertical: axis(vertical, defaults.vertical),
                };
                nav_doctor::check_limits(&limits)?;
                self.fleet.set_limits(&drones, limits)?;
            }
            ShellCmd::Status { names } => {
                let names = if names.is_empty() { self.fleet.names() } else { names };
                for name in names {
                    match self.fleet.query_status(&name) {
                        Ok(st) => self.print_status(&st),
                        Err(e) => warn!("shell: {}", e),
                    }
                }
            }
            ShellCmd::Stop { names } => {
                for (name, handle) in self.fleet.stop(&names) {
                    self.track(name, handle.map_err(anyhow::Error::from));
                }
            }
            ShellCmd::Kill { names } => {
                for (name, result) in self.fleet.kill(&names).await {
                    match result {
                        Ok(()) => info!("shell: {} killed", name),
                        Err(e) => warn!("shell: kill {}: {}", name, e),
                    }
                }
            }
            ShellCmd::Sync => self.sync().await,
            ShellCmd::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    fn submit(&mut self, target: &Target, spec: CommandSpec) -> Result<()> {
        let mut command = Command::new(spec);
        if let Some(s) = target.watchdog {
            anyhow::ensure!(s.is_finite() && s > 0.0, "watchdog must be a positive number of seconds");
            command = command.with_watchdog(Duration::from_secs_f64(s));
        }
        for (name, handle) in self.fleet.submit_fleet(command, &target.drones, target.queue) {
            self.track(name, handle.map_err(anyhow::Error::from));
        }
        Ok(())
    }

    fn track(&mut self, name: String, handle: Result<CommandHandle>) {
        match handle {
            Ok(h) => {
                info!("shell: {} accepted command {}", name, h.id());
                self.pending.push((name, h));
            }
            Err(e) => warn!("shell: {}: {:#}", name, e),
        }
    }

    async fn sync(&mut self) {
        for (name, mut handle) in std::mem::take(&mut self.pending) {
            let report = handle.wait().await;
            self.print_report(&name, &report);
        }
    }

    fn print_report(&self, name: &str, r: &CommandReport) {
        if self.json {
            println!("{}", serde_json::json!({ "drone": name, "report": r }));
            return;
        }
        let why = r.error.as_ref().map(|e| e.to_string()).or_else(|| r.reason.clone());
        match why {
            Some(why) => println!("{} #{} {} {:?}: {}", name, r.id, r.kind, r.status, why),
            None => println!("{} #{} {} {:?}", name, r.id, r.kind, r.status),
        }
    }

    fn print_status(&self, st: &DroneStatus) {
        if self.json {
            match serde_json::to_string(st) {
                Ok(s) => println!("{}", s),
                Err(e) => warn!("shell: status json: {}", e),
            }
            return;
        }
        let current = st
            .current_command
            .as_ref()
            .map(|c| format!("#{} {}", c.id, c.kind))
            .unwrap_or_else(|| "-".into());
        let current = if st.paused { format!("{} (paused)", current) } else { current };
        println!(
            "{} {:?} pos={} yaw={:.0} mode={} armed={} in_air={} queue={} current={}",
            st.name, st.connection, st.position, st.yaw, st.mode, st.armed, st.in_air, st.queue_depth, current
        );
    }
}

async fn print_events(mut rx: broadcast::Receiver<FleetEvent>, json: bool) {
    loop {
        match rx.recv().await {
            Ok(ev) if json => match serde_json::to_string(&ev) {
                Ok(s) => println!("{}", s),
                Err(e) => warn!("shell: event json: {}", e),
            },
            Ok(ev) => log_event(&ev),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("shell: {} events dropped", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_event(ev: &FleetEvent) {
    match &ev.kind {
        EventKind::Connection { state } => info!("{}: connection {:?}", ev.drone, state),
        EventKind::Command { id, kind, status, reason: Some(reason) } => {
            info!("{}: command {} {} {:?} ({})", ev.drone, id, kind, status, reason)
        }
        EventKind::Command { id, kind, status, reason: None } => {
            info!("{}: command {} {} {:?}", ev.drone, id, kind, status)
        }
        EventKind::Fence { message } => warn!("{}: fence {}", ev.drone, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ShellCmd {
        ShellLine::try_parse_from(line.split_whitespace()).unwrap().cmd
    }

    #[test]
    fn negative_coordinates_parse() {
        match parse("flyto 10 -3.5 -2 --yaw -90 -d tom") {
            ShellCmd::Flyto { north, east, down, yaw, target, .. } => {
                assert_eq!((north, east, down), (10.0, -3.5, -2.0));
                assert_eq!(yaw, Some(-90.0));
                assert_eq!(target.drones, vec!["tom".to_string()]);
                assert!(!target.queue);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn path_waypoints() {
        match parse("path -q --wp 5,0,-2 -w -5,5,-2") {
            ShellCmd::Path { waypoints, target, .. } => {
                assert_eq!(waypoints, vec![Vec3::new(5.0, 0.0, -2.0), Vec3::new(-5.0, 5.0, -2.0)]);
                assert!(target.queue);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_vec3("1,2").is_err());
        assert!(parse_vec3("1,x,2").is_err());
    }

    #[test]
    fn mode_and_pause() {
        match parse("mode hold -q -d tom") {
            ShellCmd::Mode { mode, target } => {
                assert_eq!(mode, "hold");
                assert!(target.queue);
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse("resume tom jerry") {
            ShellCmd::Resume { names } => assert_eq!(names, vec!["tom".to_string(), "jerry".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parse("pause"), ShellCmd::Pause { names } if names.is_empty()));
    }

    #[test]
    fn fence_bounds() {
        match parse("fence --north -5 5 --east -5 5 --down -10 0 --mode clip") {
            ShellCmd::Fence { north, down, mode, off, .. } => {
                assert_eq!(north, Some(vec![-5.0, 5.0]));
                assert_eq!(down, Some(vec![-10.0, 0.0]));
                assert_eq!(mode, "clip");
                assert!(!off);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn config_sections() {
        let cfg: Config = toml::from_str(
            r#"
            [link]
            sys_id = 250

            [drone]
            control_hz = 10.0

            [drone.fence]
            north = [-5.0, 5.0]
            east = [-5.0, 5.0]
            down = [-10.0, 0.0]
            mode = "clip"

            [drones]
            tom = "udp://:14540"
            jerry = "udp://:14541"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.link.sys_id, 250);
        assert_eq!(cfg.link.target_sys, 1);
        assert_eq!(cfg.drone.debounce_ticks(), 5);
        assert_eq!(cfg.drone.fence.as_ref().map(|f| f.mode), Some(FenceMode::Clip));
        assert_eq!(cfg.drones.len(), 2);
        doctor(&cfg).unwrap();
    }

    #[test]
    fn doctor_rejects_shared_address() {
        let mut cfg = Config::default();
        cfg.drones.insert("tom".into(), "udp://:14540".into());
        cfg.drones.insert("jerry".into(), "udpin://0.0.0.0:14540".into());
        assert!(doctor(&cfg).is_err());
    }
}
