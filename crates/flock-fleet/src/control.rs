//! The per-drone control loop.
//!
//! One task per drone ticks at the control rate: it reads the freshest
//! telemetry, picks up the scheduler's running command, advances its
//! execution by one step and reports completion back. Nothing here waits on
//! another drone; command acknowledgments run in their own tasks so a slow
//! flight controller never stalls the tick.
//!
//! While the scheduler is paused, a running movement, velocity or wait
//! command is frozen in place: the drone holds position and the command's
//! deadlines are pushed back by the paused time once it resumes.

use flock_fc::{lock, AdapterError};
use flock_nav::{FenceEngine, FenceMode, FenceVerdict, NavigationSession, PathFollower, PathGenerator};
use flock_proto::{
    CommandKind, CommandSpec, ConnectionState, ControlOutput, PositionSetpoint, TelemetrySample, Vec3,
    VelocitySetpoint,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::drone::DroneShared;
use crate::error::CommandError;

type Ack = JoinHandle<Result<(), AdapterError>>;

/// Condition over telemetry that completes a primitive once acknowledged.
#[derive(Debug, Clone, Copy)]
enum Predicate {
    Armed(bool),
    /// In the air at least `altitude` above `ground_z` (NED down).
    Airborne { ground_z: f64, altitude: f64 },
    Landed,
    /// Nothing to observe beyond the acknowledgment.
    Accepted,
}

impl Predicate {
    fn holds(&self, t: &TelemetrySample, tolerance: f64) -> bool {
        match *self {
            Predicate::Armed(armed) => t.armed == armed,
            Predicate::Airborne { ground_z, altitude } => t.in_air && ground_z - t.position.z >= altitude - tolerance,
            Predicate::Landed => !t.in_air,
            Predicate::Accepted => true,
        }
    }
}

enum Stage {
    /// Waiting for the flight controller to acknowledge a primitive.
    Ack { ack: Ack, then: Predicate },
    Settle { predicate: Predicate, settled: u32 },
    Navigate { session: NavigationSession, fence: Option<Arc<FenceEngine>>, clipping: bool },
    Velocity { setpoint: VelocitySetpoint, until: Instant, fence: Option<Arc<FenceEngine>>, clipping: bool },
    Wait { until: Instant },
}

impl Stage {
    fn pausable(&self) -> bool {
        matches!(self, Stage::Navigate { .. } | Stage::Velocity { .. } | Stage::Wait { .. })
    }

    /// Where to hold while this stage is paused; `None` keeps the previous hold.
    fn pause_setpoint(&self, sample: &TelemetrySample) -> Option<PositionSetpoint> {
        match self {
            Stage::Navigate { .. } | Stage::Velocity { .. } => {
                Some(PositionSetpoint::at(sample.position, Some(sample.yaw_deg())))
            }
            _ => None,
        }
    }
}

struct Execution {
    id: u64,
    kind: CommandKind,
    watchdog: Option<Instant>,
    stage: Stage,
}

impl Execution {
    /// Continues after being frozen for `paused`, from where the vehicle is now.
    fn resume(&mut self, paused: Duration, sample: &TelemetrySample) {
        if let Some(w) = self.watchdog.as_mut() {
            *w += paused;
        }
        match &mut self.stage {
            Stage::Navigate { session, .. } => session.resume(sample),
            Stage::Velocity { until, .. } | Stage::Wait { until } => *until += paused,
            _ => {}
        }
    }
}

/// A running command frozen by a pause.
struct Paused {
    id: u64,
    since: Instant,
    hold: Option<PositionSetpoint>,
}

enum Step {
    Continue,
    Next(Stage),
    Done(Result<(), CommandError>),
}

pub(crate) async fn run(shared: Arc<DroneShared>, mut stop: watch::Receiver<bool>) {
    let dt = shared.cfg.control_period().as_secs_f64();
    let mut ticker = tokio::time::interval(shared.cfg.control_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut telemetry = shared.adapter.telemetry();
    let mut exec: Option<Execution> = None;
    let mut hold: Option<PositionSetpoint> = None;
    let mut paused: Option<Paused> = None;

    info!("drone {}: control loop at {:.0} Hz", shared.name, 1.0 / dt);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }

        let sample = telemetry.borrow_and_update().clone();

        if shared.adapter.link_state() == ConnectionState::Lost {
            warn!("drone {}: link lost", shared.name);
            abandon(&mut exec, &mut hold, &sample);
            shared.set_connection(ConnectionState::Lost);
            lock(&shared.scheduler).close(Some(CommandError::Connection("link lost".into())));
            break;
        }

        let active = lock(&shared.scheduler).activate();
        if exec.as_ref().map(|e| e.id) != active {
            if let Some(old) = &exec {
                debug!("drone {}: command {} no longer running, holding", shared.name, old.id);
            }
            abandon(&mut exec, &mut hold, &sample);
            if let Some(id) = active {
                let command = lock(&shared.scheduler).command(id).cloned();
                if let Some(command) = command {
                    match start(&shared, id, &command, &sample) {
                        Ok(e) => exec = Some(e),
                        Err(err) => lock(&shared.scheduler).finish(id, Err(err)),
                    }
                }
            }
        }

        if paused.as_ref().is_some_and(|p| exec.as_ref().map(|e| e.id) != Some(p.id)) {
            // the paused command went away; stay where the pause left the vehicle
            if let Some(sp) = paused.take().and_then(|p| p.hold) {
                hold = Some(sp);
            }
        }
        let pause_requested = lock(&shared.scheduler).is_paused();
        if let Some(e) = exec.as_mut() {
            if pause_requested && e.stage.pausable() {
                let p = paused.get_or_insert_with(|| {
                    info!("drone {}: command {} paused", shared.name, e.id);
                    Paused { id: e.id, since: Instant::now(), hold: e.stage.pause_setpoint(&sample).or(hold) }
                });
                if let Some(sp) = p.hold.filter(|_| sample.in_air && sample.armed) {
                    if let Err(err) = shared.adapter.set_position_setpoint(&sp).await {
                        debug!("drone {}: hold setpoint not sent: {}", shared.name, err);
                    }
                }
                continue;
            }
            if let Some(p) = paused.take() {
                let frozen = p.since.elapsed();
                e.resume(frozen, &sample);
                info!("drone {}: command {} resumed after {:.1} s", shared.name, e.id, frozen.as_secs_f64());
            }
        }

        let Some(e) = exec.as_mut() else {
            if let Some(sp) = hold {
                if !sample.in_air {
                    hold = None;
                } else if sample.armed {
                    if let Err(err) = shared.adapter.set_position_setpoint(&sp).await {
                        debug!("drone {}: hold setpoint not sent: {}", shared.name, err);
                    }
                }
            }
            continue;
        };

        let step = match e.watchdog {
            Some(deadline) if Instant::now() >= deadline => Step::Done(Err(watchdog_error(e.kind))),
            _ => advance(&shared, e, &sample, dt).await,
        };
        match step {
            Step::Continue => {}
            Step::Next(stage) => e.stage = stage,
            Step::Done(result) => {
                if let Some(done) = exec.take() {
                    complete(&shared, done, result, &sample, &mut hold);
                }
            }
        }
    }

    abandon(&mut exec, &mut hold, &TelemetrySample::default());
    debug!("drone {}: control loop stopped", shared.name);
}

/// Drops an execution that is no longer running, leaving the vehicle holding
/// its last commanded position.
fn abandon(exec: &mut Option<Execution>, hold: &mut Option<PositionSetpoint>, sample: &TelemetrySample) {
    let Some(e) = exec.take() else { return };
    match e.stage {
        Stage::Ack { ack, .. } => ack.abort(),
        Stage::Navigate { session, .. } => *hold = Some(session.hold_setpoint(sample)),
        Stage::Velocity { .. } => *hold = Some(PositionSetpoint::at(sample.position, Some(sample.yaw_deg()))),
        Stage::Settle { .. } | Stage::Wait { .. } => {}
    }
}

fn complete(
    shared: &DroneShared,
    done: Execution,
    result: Result<(), CommandError>,
    sample: &TelemetrySample,
    hold: &mut Option<PositionSetpoint>,
) {
    let id = done.id;
    match done.kind {
        // the flight controller owns the vehicle after these
        CommandKind::Land | CommandKind::Takeoff | CommandKind::Disarm | CommandKind::FlightMode if result.is_ok() => {
            *hold = None
        }
        _ => {
            let mut e = Some(done);
            abandon(&mut e, hold, sample);
        }
    }
    lock(&shared.scheduler).finish(id, result);
}

fn watchdog_error(kind: CommandKind) -> CommandError {
    if kind.is_movement() {
        CommandError::NavigationDivergence(format!("{} did not converge before its watchdog expired", kind))
    } else {
        CommandError::Rejected(format!("{} did not complete before its watchdog expired", kind))
    }
}

fn spawn_ack(shared: &DroneShared, spec: &CommandSpec) -> Ack {
    let adapter = shared.adapter.clone();
    let spec = spec.clone();
    tokio::spawn(async move {
        match spec {
            CommandSpec::Arm => adapter.arm().await,
            CommandSpec::Disarm => adapter.disarm().await,
            CommandSpec::Takeoff { altitude } => adapter.request_takeoff(altitude).await,
            CommandSpec::Land => adapter.land().await,
            CommandSpec::FlightMode { mode } => adapter.set_flight_mode(&mode).await,
            _ => Ok(()),
        }
    })
}

fn start(shared: &DroneShared, id: u64, command: &Command, sample: &TelemetrySample) -> Result<Execution, CommandError> {
    let nav = &shared.cfg.nav;
    let now = Instant::now();
    let stage = match &command.spec {
        CommandSpec::Arm => Stage::Ack { ack: spawn_ack(shared, &command.spec), then: Predicate::Armed(true) },
        CommandSpec::Disarm => Stage::Ack { ack: spawn_ack(shared, &command.spec), then: Predicate::Armed(false) },
        CommandSpec::Takeoff { altitude } => Stage::Ack {
            ack: spawn_ack(shared, &command.spec),
            then: Predicate::Airborne { ground_z: sample.position.z, altitude: *altitude },
        },
        CommandSpec::Land => Stage::Ack { ack: spawn_ack(shared, &command.spec), then: Predicate::Landed },
        CommandSpec::FlightMode { .. } => Stage::Ack { ack: spawn_ack(shared, &command.spec), then: Predicate::Accepted },
        CommandSpec::FlyTo { target, yaw, tolerance } => {
            navigate(shared, sample, vec![*target], *yaw, *tolerance, nav.yaw_tolerance, false)?
        }
        CommandSpec::FollowPath { waypoints, yaw, tolerance } => {
            navigate(shared, sample, waypoints.clone(), *yaw, *tolerance, nav.yaw_tolerance, true)?
        }
        CommandSpec::Move { offset, yaw, tolerance } => {
            navigate(shared, sample, vec![sample.position + *offset], *yaw, *tolerance, nav.yaw_tolerance, false)?
        }
        CommandSpec::Yaw { yaw, tolerance } => {
            navigate(shared, sample, vec![sample.position], Some(*yaw), nav.tolerance, *tolerance, false)?
        }
        CommandSpec::Velocity { velocity, yaw_rate, seconds } => Stage::Velocity {
            setpoint: VelocitySetpoint { velocity: *velocity, yaw_rate: *yaw_rate },
            until: now + Duration::from_secs_f64(seconds.max(0.0)),
            fence: shared.fence(),
            clipping: false,
        },
        CommandSpec::Wait { seconds } => Stage::Wait { until: now + Duration::from_secs_f64(seconds.max(0.0)) },
    };
    debug!("drone {}: starting command {} ({})", shared.name, id, command.kind());
    Ok(Execution { id, kind: command.kind(), watchdog: command.watchdog.map(|d| now + d), stage })
}

/// Builds the navigation session for a movement command. Fence and limits are
/// captured here and stay fixed while the command runs.
fn navigate(
    shared: &DroneShared,
    sample: &TelemetrySample,
    mut targets: Vec<Vec3>,
    yaw: Option<f64>,
    tolerance: f64,
    yaw_tolerance: f64,
    path: bool,
) -> Result<Stage, CommandError> {
    let fence = shared.fence();
    if let Some(f) = &fence {
        match f.mode() {
            FenceMode::Reject => {
                for t in &targets {
                    if let Err(msg) = f.check_target(*t) {
                        shared.fence_event(&msg);
                        return Err(CommandError::FenceViolation(msg));
                    }
                }
            }
            FenceMode::Clip => {
                for t in targets.iter_mut() {
                    let clamped = f.clamp(*t);
                    if clamped != *t {
                        shared.fence_event(&format!("target {} clipped to {}", t, clamped));
                        *t = clamped;
                    }
                }
            }
        }
    }

    let limits = *shared.limits();
    let generator = if path {
        PathGenerator::path(sample.position, targets, yaw, limits)
    } else {
        PathGenerator::direct(targets.first().copied().unwrap_or(sample.position), yaw)
    };
    let follower = PathFollower::new(&shared.cfg.nav, limits);
    let session = NavigationSession::new(generator, follower, limits, tolerance, yaw_tolerance, shared.cfg.debounce_ticks());
    Ok(Stage::Navigate { session, fence, clipping: false })
}

/// Runs `output` through the fence. `Err` means the command must fail.
fn enforce(
    shared: &DroneShared,
    fence: Option<&FenceEngine>,
    output: ControlOutput,
    position: Vec3,
    clipping: &mut bool,
) -> Result<ControlOutput, CommandError> {
    let Some(fence) = fence else { return Ok(output) };
    match fence.apply(output, position) {
        FenceVerdict::Pass(out) => {
            *clipping = false;
            Ok(out)
        }
        FenceVerdict::Clipped { output, message } => {
            // report once per excursion, not every tick
            if !*clipping {
                shared.fence_event(&message);
            }
            *clipping = true;
            Ok(output)
        }
        FenceVerdict::Violation(msg) => {
            shared.fence_event(&msg);
            Err(CommandError::FenceViolation(msg))
        }
    }
}

async fn send(shared: &DroneShared, output: &ControlOutput) -> Result<(), CommandError> {
    let r = match output {
        ControlOutput::Position(sp) => shared.adapter.set_position_setpoint(sp).await,
        ControlOutput::Velocity(sp) => shared.adapter.set_velocity_setpoint(sp).await,
    };
    r.map_err(CommandError::from)
}

async fn advance(shared: &DroneShared, e: &mut Execution, sample: &TelemetrySample, dt: f64) -> Step {
    let tolerance = shared.cfg.nav.tolerance;
    match &mut e.stage {
        Stage::Ack { ack, then } => {
            if !ack.is_finished() {
                return Step::Continue;
            }
            let predicate = *then;
            match ack.await {
                Ok(Ok(())) => Step::Next(Stage::Settle { predicate, settled: 0 }),
                Ok(Err(err)) => Step::Done(Err(err.into())),
                Err(join) => Step::Done(Err(CommandError::Connection(format!("acknowledgment task failed: {}", join)))),
            }
        }
        Stage::Settle { predicate, settled } => {
            if predicate.holds(sample, tolerance) {
                *settled += 1;
            } else {
                *settled = 0;
            }
            if *settled >= shared.cfg.debounce_ticks() {
                Step::Done(Ok(()))
            } else {
                Step::Continue
            }
        }
        Stage::Navigate { session, fence, clipping } => {
            let update = {
                let mut slot = lock(&shared.path_update);
                match slot.as_ref() {
                    Some((id, _)) if *id == e.id => slot.take(),
                    _ => None,
                }
            };
            if let Some((_, mut waypoints)) = update {
                if let Some(f) = fence.as_deref().filter(|f| f.mode() == FenceMode::Clip) {
                    waypoints.iter_mut().for_each(|w| *w = f.clamp(*w));
                }
                info!("drone {}: path updated, {} waypoints", shared.name, waypoints.len());
                session.update_waypoints(waypoints, sample.position);
            }

            let out = session.tick(sample, dt);
            let out = match enforce(shared, fence.as_deref(), out, sample.position, clipping) {
                Ok(out) => out,
                Err(err) => return Step::Done(Err(err)),
            };
            if let Err(err) = send(shared, &out).await {
                return Step::Done(Err(err));
            }
            if session.reached() {
                Step::Done(Ok(()))
            } else {
                Step::Continue
            }
        }
        Stage::Velocity { setpoint, until, fence, clipping } => {
            if Instant::now() >= *until {
                return Step::Done(Ok(()));
            }
            let out = match enforce(shared, fence.as_deref(), ControlOutput::Velocity(*setpoint), sample.position, clipping) {
                Ok(out) => out,
                Err(err) => return Step::Done(Err(err)),
            };
            match send(shared, &out).await {
                Ok(()) => Step::Continue,
                Err(err) => Step::Done(Err(err)),
            }
        }
        Stage::Wait { until } => {
            if Instant::now() >= *until {
                Step::Done(Ok(()))
            } else {
                Step::Continue
            }
        }
    }
}
