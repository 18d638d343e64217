//! Public facade of the lift motor.
//!
//! `LiftMotor` owns the command queue and the background threads. Every
//! hardware operation is queued; blocking calls wait for the worker's
//! reply, non-blocking calls return `Ok(None)` immediately and the outcome
//! shows up in [`LiftMotor::get_status`].

use crate::clock::{Sleeper, ThreadSleeper};
use crate::config::{LiftConfig, MotionDefaults};
use crate::error::{DriveError, Result};
use crate::worker::{self, Command, Context, JoinTimeout, Operation, Shared, WorkerSettings};
use crate::transport::Connector;
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Cached motor state, updated by the worker after every operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MotorState {
    pub position: i32,
    pub velocity: i32,
    pub homed: bool,
    /// A homing or move is executing.
    pub active: bool,
    #[serde(rename = "error_state")]
    pub last_error: Option<String>,
    pub connected: bool,
    pub statusword: u16,
}

pub struct LiftMotor {
    commands: Sender<Command>,
    shared: Arc<Shared>,
    settings: WorkerSettings,
    motion: MotionDefaults,
    stop_tx: Mutex<Option<Sender<()>>>,
    connection: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl LiftMotor {
    /// Start the connection thread against `connector`.
    ///
    /// Returns immediately; the drive is connected and initialized in the
    /// background. Fails with [`DriveError::Config`] if `config` does not
    /// validate.
    pub fn start(
        connector: Arc<dyn Connector>,
        sleeper: Arc<dyn Sleeper>,
        config: &LiftConfig,
    ) -> Result<Self> {
        config.validate()?;
        let settings = config.worker_settings();
        let shared = Arc::new(Shared::default());
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);

        let ctx = Context {
            connector,
            sleeper,
            timing: config.drive_timing(),
            homing: config.homing,
            settings: settings.clone(),
            shared: shared.clone(),
            stop_rx,
        };
        let connection = worker::spawn_connection(ctx, command_rx)
            .map_err(|e| DriveError::io("spawn connection thread", e))?;

        Ok(Self {
            commands,
            shared,
            settings,
            motion: config.motion,
            stop_tx: Mutex::new(Some(stop_tx)),
            connection: Mutex::new(Some(connection)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start against the TCP controller named in `config`.
    pub fn connect(config: &LiftConfig) -> Result<Self> {
        Self::start(Arc::new(config.connector()), Arc::new(ThreadSleeper), config)
    }

    fn submit(&self, operation: Operation, blocking: bool) -> Result<Option<bool>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DriveError::WorkerStopped);
        }

        if !blocking {
            self.commands
                .send(Command {
                    operation,
                    reply: None,
                    deadline: None,
                })
                .map_err(|_| DriveError::WorkerStopped)?;
            return Ok(None);
        }

        let timeout = self.settings.command_timeout;
        let (reply, result) = crossbeam_channel::bounded(1);
        self.commands
            .send(Command {
                operation,
                reply: Some(reply),
                deadline: Some(Instant::now() + timeout),
            })
            .map_err(|_| DriveError::WorkerStopped)?;

        match result.recv_timeout(timeout) {
            Ok(outcome) => outcome.map(Some),
            Err(RecvTimeoutError::Timeout) => Err(DriveError::OperationTimedOut(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(DriveError::WorkerStopped),
        }
    }

    /// Move to `target` with explicit profile parameters.
    ///
    /// Fails with [`DriveError::NotHomed`] without queuing anything while the
    /// cached state says the axis is not homed.
    pub fn move_to_position(
        &self,
        target: i32,
        velocity: i32,
        acceleration: i32,
        blocking: bool,
    ) -> Result<Option<bool>> {
        if !self.shared.state.lock().homed {
            return Err(DriveError::NotHomed);
        }
        self.submit(
            Operation::Move {
                target,
                velocity,
                acceleration,
            },
            blocking,
        )
    }

    /// Move with the configured default velocity and acceleration.
    pub fn move_to(&self, target: i32, blocking: bool) -> Result<Option<bool>> {
        self.move_to_position(
            target,
            self.motion.velocity,
            self.motion.acceleration,
            blocking,
        )
    }

    pub fn home(&self, blocking: bool) -> Result<Option<bool>> {
        self.submit(Operation::Home, blocking)
    }

    pub fn fault_reset(&self, blocking: bool) -> Result<Option<bool>> {
        self.submit(Operation::FaultReset, blocking)
    }

    pub fn refresh(&self, blocking: bool) -> Result<Option<bool>> {
        self.submit(Operation::Refresh, blocking)
    }

    /// Snapshot of the cached state. Never touches the drive.
    pub fn get_status(&self) -> MotorState {
        self.shared.state.lock().clone()
    }

    /// Last statusword seen by the worker.
    pub fn get_statusword(&self) -> u16 {
        self.shared.state.lock().statusword
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    pub fn is_homed(&self) -> bool {
        self.shared.state.lock().homed
    }

    /// Wait until the drive is connected, up to `timeout`.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.connected {
            if self
                .shared
                .connected
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.connected;
            }
        }
        true
    }

    /// Stop the background threads and close the connection.
    ///
    /// A command that is mid-flight is not interrupted; the join gives up
    /// after the configured join timeout. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down lift motor");
        self.shared.stop.store(true, Ordering::SeqCst);
        drop(self.stop_tx.lock().take());

        let join_timeout = self.settings.join_timeout;
        if let Some(handle) = self.connection.lock().take() {
            if handle.join_timeout(join_timeout).is_err() {
                error!(
                    "Connection thread did not stop within {:?}",
                    join_timeout
                );
            }
        }
        let worker = self.shared.worker.lock().take();
        if let Some(handle) = worker {
            if handle.join_timeout(join_timeout).is_err() {
                error!("Motor worker did not stop within {:?}", join_timeout);
            }
        }

        let mut state = self.shared.state.lock();
        state.connected = false;
        state.active = false;
    }
}

impl Drop for LiftMotor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
