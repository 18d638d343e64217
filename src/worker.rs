//! Connection thread and single command worker.
//!
//! All drive I/O happens on one worker thread that owns the [`Drive`].
//! Callers hand it [`Command`]s over an unbounded crossbeam channel, which
//! serialises hardware access and keeps submission order. The connection
//! thread keeps retrying until a drive answers and only then starts the
//! worker, so commands submitted early simply wait in the queue.

use crate::clock::Sleeper;
use crate::drive::{Drive, DriveTiming, HomingParams};
use crate::error::{DriveError, Result};
use crate::motor::MotorState;
use crate::transport::Connector;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Work items executed by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Home,
    Move {
        target: i32,
        velocity: i32,
        acceleration: i32,
    },
    /// Full recovery: fault reset and re-enable.
    FaultReset,
    /// Re-read live drive state into the cache.
    Refresh,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Home => "home",
            Operation::Move { .. } => "move",
            Operation::FaultReset => "fault_reset",
            Operation::Refresh => "refresh",
        }
    }

    fn sets_active(&self) -> bool {
        matches!(self, Operation::Home | Operation::Move { .. })
    }
}

/// A queued operation and, for blocking callers, where to send its result.
#[derive(Debug)]
pub(crate) struct Command {
    pub operation: Operation,
    pub reply: Option<Sender<Result<bool>>>,
    /// Blocking callers stop waiting after this instant.
    pub deadline: Option<Instant>,
}

/// Connection management and queue timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Connection attempts per establish round.
    pub connect_retries: u32,
    pub retry_delay: Duration,
    /// Pause between establish rounds while the drive is unreachable at startup.
    pub reconnect_interval: Duration,
    /// Queue poll timeout; bounds how long a stop request goes unnoticed.
    pub queue_poll: Duration,
    pub command_timeout: Duration,
    pub join_timeout: Duration,
    /// Reconnect and retry a command once when the link drops under it.
    pub retry_on_disconnect: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            connect_retries: 3,
            retry_delay: Duration::from_secs(3),
            reconnect_interval: Duration::from_secs(5),
            queue_poll: Duration::from_millis(100),
            command_timeout: Duration::from_secs(300),
            join_timeout: Duration::from_secs(2),
            retry_on_disconnect: true,
        }
    }
}

/// State shared between the facade and the background threads.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub state: Mutex<MotorState>,
    /// Notified whenever `state.connected` becomes true.
    pub connected: Condvar,
    pub stop: AtomicBool,
    pub worker: Mutex<Option<JoinHandle<()>>>,
}

/// Everything a background thread needs to (re)build a drive.
#[derive(Clone)]
pub(crate) struct Context {
    pub connector: Arc<dyn Connector>,
    pub sleeper: Arc<dyn Sleeper>,
    pub timing: DriveTiming,
    pub homing: HomingParams,
    pub settings: WorkerSettings,
    pub shared: Arc<Shared>,
    /// Never carries a message; disconnects when shutdown drops the sender.
    pub stop_rx: Receiver<()>,
}

impl Context {
    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless shutdown is requested first.
    /// Returns true when the caller should stop.
    fn wait(&self, duration: Duration) -> bool {
        match self.stop_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.stopped(),
            _ => true,
        }
    }

    fn open_drive(&self) -> Result<(Drive, bool, i32)> {
        let transport = self.connector.connect()?;
        let mut drive = Drive::new(transport, self.sleeper.clone(), self.timing, self.homing);
        let probe = drive
            .initialize()
            .and_then(|_| Ok((drive.is_homed()?, drive.read_position()?)));
        match probe {
            Ok((homed, position)) => Ok((drive, homed, position)),
            Err(e) => {
                drive.close();
                Err(e)
            }
        }
    }

    /// Connect and initialize with bounded retries.
    ///
    /// On success `last_error` is set to `retained_error`, so a reconnect
    /// that follows a failed command keeps that failure visible.
    fn establish(&self, retained_error: Option<String>) -> Result<Drive> {
        let retries = self.settings.connect_retries.max(1);
        let mut last_error = DriveError::Disconnected;

        for attempt in 1..=retries {
            if self.stopped() {
                return Err(DriveError::WorkerStopped);
            }
            match self.open_drive() {
                Ok((drive, homed, position)) => {
                    {
                        let mut state = self.shared.state.lock();
                        state.connected = true;
                        state.active = false;
                        state.last_error = retained_error;
                        state.homed = homed;
                        state.position = position;
                        state.statusword = drive.statusword();
                    }
                    self.shared.connected.notify_all();
                    info!(
                        homed,
                        position,
                        "Connected to drive at {}",
                        self.connector.describe()
                    );
                    return Ok(drive);
                }
                Err(e) => {
                    warn!(attempt, retries, "Drive connection attempt failed: {}", e);
                    {
                        let mut state = self.shared.state.lock();
                        state.connected = false;
                        state.active = false;
                        state.last_error = Some(e.to_string());
                    }
                    last_error = e;
                    if attempt < retries && self.wait(self.settings.retry_delay) {
                        return Err(DriveError::WorkerStopped);
                    }
                }
            }
        }
        Err(last_error)
    }
}

/// Start the connection thread. It spawns the worker once a drive answers.
pub(crate) fn spawn_connection(
    ctx: Context,
    commands: Receiver<Command>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("lift-connect".to_string())
        .spawn(move || connection_loop(ctx, commands))
}

fn connection_loop(ctx: Context, commands: Receiver<Command>) {
    info!("Connecting to drive at {}", ctx.connector.describe());
    loop {
        if ctx.stopped() {
            return;
        }
        match ctx.establish(None) {
            Ok(drive) => {
                let shared = ctx.shared.clone();
                let worker = Worker {
                    ctx,
                    drive: Some(drive),
                    commands,
                };
                match thread::Builder::new()
                    .name("lift-worker".to_string())
                    .spawn(move || worker.run())
                {
                    Ok(handle) => *shared.worker.lock() = Some(handle),
                    Err(e) => error!("Failed to start motor worker: {}", e),
                }
                return;
            }
            Err(DriveError::WorkerStopped) => return,
            Err(e) => {
                error!(
                    "Drive unreachable ({}), retrying in {:?}",
                    e, ctx.settings.reconnect_interval
                );
                if ctx.wait(ctx.settings.reconnect_interval) {
                    return;
                }
            }
        }
    }
}

/// Cache updates produced by a successful operation.
struct Completion {
    value: bool,
    homed: Option<bool>,
    velocity: Option<i32>,
}

impl Completion {
    fn done(value: bool) -> Self {
        Self {
            value,
            homed: None,
            velocity: None,
        }
    }
}

struct Worker {
    ctx: Context,
    drive: Option<Drive>,
    commands: Receiver<Command>,
}

impl Worker {
    fn run(mut self) {
        info!("Motor worker started");
        while !self.ctx.stopped() {
            match self.commands.recv_timeout(self.ctx.settings.queue_poll) {
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.drop_drive();
        info!("Motor worker stopped");
    }

    fn handle(&mut self, command: Command) {
        let operation = command.operation;
        if command.deadline.is_some_and(|d| Instant::now() > d) {
            warn!(
                operation = operation.name(),
                "Skipping command, caller stopped waiting"
            );
            return;
        }

        debug!(operation = operation.name(), "Executing command");
        if operation.sets_active() {
            self.ctx.shared.state.lock().active = true;
        }

        let mut result = self.execute(operation);
        if self.ctx.settings.retry_on_disconnect
            && matches!(&result, Err(e) if e.is_connection())
        {
            warn!(
                operation = operation.name(),
                "Connection lost, reconnecting and retrying once"
            );
            self.drop_drive();
            result = self.reconnect(None).and_then(|_| self.execute(operation));
        }

        match result {
            Ok(completion) => {
                let value = completion.value;
                self.record_success(completion);
                if let Some(reply) = command.reply {
                    let _ = reply.send(Ok(value));
                }
            }
            Err(e) => {
                error!(operation = operation.name(), "Command failed: {}", e);
                self.record_failure(&e);
                let failure = e.to_string();
                if let Some(reply) = command.reply {
                    let _ = reply.send(Err(e));
                }
                self.recover(failure);
            }
        }
    }

    fn execute(&mut self, operation: Operation) -> Result<Completion> {
        if self.drive.is_none() {
            self.reconnect(None)?;
        }
        let drive = self.drive.as_mut().ok_or(DriveError::Disconnected)?;

        match operation {
            Operation::Home => {
                let value = drive.home()?;
                Ok(Completion {
                    value,
                    homed: Some(true),
                    velocity: None,
                })
            }
            Operation::Move {
                target,
                velocity,
                acceleration,
            } => drive
                .move_to_position(target, velocity, acceleration)
                .map(Completion::done),
            Operation::FaultReset => {
                drive.initialize()?;
                Ok(Completion {
                    value: true,
                    homed: Some(drive.is_homed()?),
                    velocity: None,
                })
            }
            Operation::Refresh => {
                drive.read_statusword()?;
                drive.read_position()?;
                let velocity = drive.read_velocity()?;
                let homed = drive.is_homed()?;
                Ok(Completion {
                    value: true,
                    homed: Some(homed),
                    velocity: Some(velocity),
                })
            }
        }
    }

    fn record_success(&self, completion: Completion) {
        let mut state = self.ctx.shared.state.lock();
        state.connected = true;
        state.active = false;
        state.last_error = None;
        if let Some(homed) = completion.homed {
            state.homed = homed;
        }
        if let Some(velocity) = completion.velocity {
            state.velocity = velocity;
        }
        if let Some(drive) = &self.drive {
            if let Some(position) = drive.position() {
                state.position = position;
            }
            state.statusword = drive.statusword();
        }
    }

    fn record_failure(&self, error: &DriveError) {
        let mut state = self.ctx.shared.state.lock();
        state.connected = false;
        state.active = false;
        state.last_error = Some(error.to_string());
        if let Some(drive) = &self.drive {
            state.statusword = drive.statusword();
        }
    }

    /// After a failure: drop the link and rebuild it with bounded retries.
    /// The failure stays in `last_error` until a later command succeeds.
    fn recover(&mut self, failure: String) {
        self.drop_drive();
        if self.ctx.stopped() {
            return;
        }
        if let Err(e) = self.reconnect(Some(failure)) {
            warn!("Reconnect after failure did not succeed: {}", e);
        }
    }

    fn reconnect(&mut self, retained_error: Option<String>) -> Result<()> {
        let drive = self.ctx.establish(retained_error)?;
        self.drive = Some(drive);
        Ok(())
    }

    fn drop_drive(&mut self) {
        if let Some(mut drive) = self.drive.take() {
            drive.close();
        }
    }
}

/// Join a thread, giving up after `timeout`.
pub(crate) trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> thread::Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = tx.send(self.join());
        });
        match rx.recv_timeout(timeout) {
            Ok(joined) => joined.map(|_| ()),
            Err(_) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "thread join timeout",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingSleeper;
    use crate::sim::{SimOptions, SimulatedDrive};

    fn context(sim: &SimulatedDrive, settings: WorkerSettings) -> (Context, Sender<()>) {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let ctx = Context {
            connector: Arc::new(sim.clone()),
            sleeper: Arc::new(RecordingSleeper::new()),
            timing: DriveTiming::default(),
            homing: HomingParams::default(),
            settings,
            shared: Arc::new(Shared::default()),
            stop_rx,
        };
        (ctx, stop_tx)
    }

    fn fast_settings() -> WorkerSettings {
        WorkerSettings {
            retry_delay: Duration::from_millis(5),
            reconnect_interval: Duration::from_millis(5),
            queue_poll: Duration::from_millis(5),
            command_timeout: Duration::from_secs(5),
            ..WorkerSettings::default()
        }
    }

    #[test]
    fn test_establish_retries_refused_connections() {
        let sim = SimulatedDrive::new(SimOptions {
            refused_connections: 2,
            homed: true,
            ..SimOptions::default()
        });
        let (ctx, _stop) = context(&sim, fast_settings());

        let drive = ctx.establish(None).unwrap();
        assert_eq!(drive.position(), Some(12_000));
        let state = ctx.shared.state.lock().clone();
        assert!(state.connected);
        assert!(state.homed);
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn test_establish_gives_up_after_retries() {
        let sim = SimulatedDrive::new(SimOptions {
            refused_connections: 10,
            ..SimOptions::default()
        });
        let (ctx, _stop) = context(&sim, fast_settings());

        let err = ctx.establish(None).err().unwrap();
        assert!(err.is_connection());
        let state = ctx.shared.state.lock().clone();
        assert!(!state.connected);
        assert!(state.last_error.is_some());
    }

    #[test]
    fn test_wait_returns_early_on_stop() {
        let sim = SimulatedDrive::new(SimOptions::default());
        let (ctx, stop) = context(&sim, fast_settings());
        drop(stop);

        let started = Instant::now();
        assert!(ctx.wait(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_worker_retries_once_after_link_drop() {
        let sim = SimulatedDrive::new(SimOptions {
            homed: true,
            ..SimOptions::default()
        });
        let (ctx, _stop) = context(&sim, fast_settings());
        let drive = ctx.establish(None).unwrap();
        let (_tx, rx) = crossbeam_channel::unbounded();
        let mut worker = Worker {
            ctx,
            drive: Some(drive),
            commands: rx,
        };

        sim.drop_next_exchanges(1);
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        worker.handle(Command {
            operation: Operation::Refresh,
            reply: Some(reply_tx),
            deadline: None,
        });

        assert!(reply_rx.recv().unwrap().unwrap());
        assert_eq!(sim.connections(), 2);
        assert!(worker.ctx.shared.state.lock().connected);
    }

    #[test]
    fn test_failed_command_error_survives_reconnect() {
        let sim = SimulatedDrive::new(SimOptions {
            homed: true,
            initial_position: 0,
            fault_on_motion: true,
            ..SimOptions::default()
        });
        let (ctx, _stop) = context(&sim, fast_settings());
        let drive = ctx.establish(None).unwrap();
        let (_tx, rx) = crossbeam_channel::unbounded();
        let mut worker = Worker {
            ctx,
            drive: Some(drive),
            commands: rx,
        };

        worker.handle(Command {
            operation: Operation::Move {
                target: 30_000,
                velocity: 2000,
                acceleration: 1000,
            },
            reply: None,
            deadline: None,
        });

        assert_eq!(sim.connections(), 2);
        let state = worker.ctx.shared.state.lock().clone();
        assert!(state.connected);
        assert!(!state.active);
        assert!(state.last_error.unwrap().contains("FAULT"));

        worker.handle(Command {
            operation: Operation::Refresh,
            reply: None,
            deadline: None,
        });
        assert_eq!(worker.ctx.shared.state.lock().last_error, None);
    }

    #[test]
    fn test_establish_wakes_connection_waiters() {
        let sim = SimulatedDrive::new(SimOptions {
            refused_connections: 1,
            ..SimOptions::default()
        });
        let (ctx, _stop) = context(&sim, fast_settings());
        let shared = ctx.shared.clone();

        let waiter = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut state = shared.state.lock();
            while !state.connected {
                if shared.connected.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            state.connected
        });

        let _drive = ctx.establish(None).unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_expired_command_is_skipped() {
        let sim = SimulatedDrive::new(SimOptions::default());
        let (ctx, _stop) = context(&sim, fast_settings());
        let (_tx, rx) = crossbeam_channel::unbounded();
        let mut worker = Worker {
            ctx,
            drive: None,
            commands: rx,
        };

        worker.handle(Command {
            operation: Operation::Home,
            reply: None,
            deadline: Some(Instant::now() - Duration::from_millis(1)),
        });
        assert_eq!(sim.frame_count(), 0);
    }

    #[test]
    fn test_join_timeout() {
        let quick = thread::spawn(|| {});
        assert!(quick.join_timeout(Duration::from_secs(1)).is_ok());

        let slow = thread::spawn(|| thread::sleep(Duration::from_millis(500)));
        assert!(slow.join_timeout(Duration::from_millis(10)).is_err());
    }
}
