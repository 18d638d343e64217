//! CiA 402 state machine for the dryve lift controller.
//!
//! Sequences the controller through
//! `FAULT -> SWITCH_ON_DISABLED -> READY_TO_SWITCH_ON -> SWITCHED_ON -> OPERATION_ENABLED`
//! and runs homing and profile-position moves as blocking multi-step
//! procedures. A `Drive` has no internal locking; it must only be driven
//! from the motor worker thread.

use crate::clock::Sleeper;
use crate::error::{DriveError, Result};
use crate::frame::{self, controlword, object};
use crate::status;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Modes of operation (object 0x6060).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum OperationMode {
    ProfilePosition = 1,
    Homing = 6,
}

/// Delays and attempt bounds of every procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveTiming {
    /// Interval between motion/homing status polls.
    pub poll_interval: Duration,
    /// Settle time after each homing parameter write.
    pub homing_settle: Duration,
    /// Settle time after each profile parameter write.
    pub move_settle: Duration,
    pub state_poll: Duration,
    pub state_attempts: u32,
    pub shutdown_poll: Duration,
    pub shutdown_attempts: u32,
    pub fault_reset_attempts: u32,
    pub fault_reset_delay: Duration,
    /// Hold time of controlword bit 7 before it is cleared again.
    pub fault_pulse: Duration,
    pub post_init_settle: Duration,
    pub mode_bit_retry: Duration,
    /// Number of identical consecutive position samples that count as stuck.
    pub stuck_window: usize,
}

impl Default for DriveTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            homing_settle: Duration::from_secs(1),
            move_settle: Duration::from_millis(50),
            state_poll: Duration::from_secs(1),
            state_attempts: 3,
            shutdown_poll: Duration::from_millis(300),
            shutdown_attempts: 10,
            fault_reset_attempts: 5,
            fault_reset_delay: Duration::from_millis(300),
            fault_pulse: Duration::from_millis(100),
            post_init_settle: Duration::from_secs(1),
            mode_bit_retry: Duration::from_millis(100),
            stuck_window: 4,
        }
    }
}

/// Homing parameters programmed before every homing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomingParams {
    /// Feed per `feed_revolutions` shaft revolutions (0x6092 sub 1).
    pub feed_constant: i32,
    pub feed_revolutions: u32,
    /// Search speed for the home switch (0x6099 sub 1).
    pub switch_speed: i32,
    /// Search speed for the zero mark (0x6099 sub 2).
    pub zero_speed: i32,
    pub acceleration: i32,
    /// Homing method (0x6098); left as configured on the drive when `None`.
    pub method: Option<i8>,
}

impl Default for HomingParams {
    fn default() -> Self {
        Self {
            feed_constant: 5400,
            feed_revolutions: 1,
            switch_speed: 1000,
            zero_speed: 1000,
            acceleration: 1000,
            method: None,
        }
    }
}

/// Sliding window over polled positions.
#[derive(Debug)]
struct StuckGuard {
    samples: VecDeque<i32>,
    window: usize,
}

impl StuckGuard {
    /// Windows below two samples are raised to two.
    fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Record a sample; true once the window is full of one value.
    fn push(&mut self, position: i32) -> bool {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(position);
        self.samples.len() == self.window && self.samples.iter().all(|p| *p == position)
    }
}

/// One controller, one connection.
pub struct Drive {
    transport: Box<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    timing: DriveTiming,
    homing: HomingParams,
    statusword: u16,
    position: Option<i32>,
}

impl Drive {
    pub fn new(
        transport: Box<dyn Transport>,
        sleeper: Arc<dyn Sleeper>,
        timing: DriveTiming,
        homing: HomingParams,
    ) -> Self {
        Self {
            transport,
            sleeper,
            timing,
            homing,
            statusword: 0,
            position: None,
        }
    }

    /// Last statusword seen on the wire.
    pub fn statusword(&self) -> u16 {
        self.statusword
    }

    /// Last actual position read from the drive.
    pub fn position(&self) -> Option<i32> {
        self.position
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        self.transport.send_and_receive(frame)
    }

    fn write(&mut self, frame: Vec<u8>) -> Result<()> {
        self.exchange(&frame).map(|_| ())
    }

    fn write_controlword(&mut self, value: u16) -> Result<()> {
        self.write(frame::controlword_frame(value))
    }

    fn settle(&self, duration: Duration) {
        self.sleeper.sleep(duration);
    }

    /// Read the statusword and return the raw response.
    pub fn read_status(&mut self) -> Result<Vec<u8>> {
        let response = self.exchange(&frame::statusword_request())?;
        frame::payload(&response, 2)?;
        if let Some(sw) = frame::decode_statusword(&response) {
            self.statusword = sw;
        }
        Ok(response)
    }

    pub fn read_statusword(&mut self) -> Result<u16> {
        self.read_status()?;
        Ok(self.statusword)
    }

    pub fn read_position(&mut self) -> Result<i32> {
        let response = self.exchange(&frame::read_request(object::POSITION_ACTUAL, 0, 4))?;
        let position = frame::payload_i32(&response)?;
        self.position = Some(position);
        Ok(position)
    }

    pub fn read_velocity(&mut self) -> Result<i32> {
        let response = self.exchange(&frame::read_request(object::VELOCITY_ACTUAL, 0, 4))?;
        frame::payload_i32(&response)
    }

    pub fn read_digital_inputs(&mut self) -> Result<u32> {
        let response = self.exchange(&frame::read_request(object::DIGITAL_INPUTS, 0, 4))?;
        frame::payload_u32(&response)
    }

    pub fn read_mode_display(&mut self) -> Result<i8> {
        let response = self.exchange(&frame::read_request(
            object::MODES_OF_OPERATION_DISPLAY,
            0,
            1,
        ))?;
        frame::payload_i8(&response)
    }

    fn read_homing_status(&mut self) -> Result<Vec<u8>> {
        let response = self.exchange(&frame::read_request(object::HOMING_STATUS, 0, 2))?;
        frame::payload(&response, 2)?;
        Ok(response)
    }

    /// Homing attained according to the dedicated homing-status object.
    pub fn is_homed(&mut self) -> Result<bool> {
        let response = self.read_homing_status()?;
        Ok(status::is_homing_attained(&response))
    }

    pub fn set_mode(&mut self, mode: OperationMode) -> Result<()> {
        debug!("Setting mode of operation {:?}", mode);
        self.write(frame::write_i8(object::MODES_OF_OPERATION, 0, mode as i8))
    }

    fn await_state(
        &mut self,
        state: &'static str,
        reached: fn(&[u8]) -> bool,
        attempts: u32,
        interval: Duration,
    ) -> Result<()> {
        for attempt in 1..=attempts {
            let response = self.read_status()?;
            if reached(&response) {
                debug!(attempt, "Reached {}", state);
                return Ok(());
            }
            debug!(
                "Waiting for {}... statusword=0x{:04x}",
                state, self.statusword
            );
            self.settle(interval);
        }
        Err(DriveError::StateTimeout {
            state,
            statusword: self.statusword,
        })
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.write_controlword(controlword::SHUTDOWN)?;
        self.await_state(
            "READY_TO_SWITCH_ON",
            status::is_shutdown,
            self.timing.shutdown_attempts,
            self.timing.shutdown_poll,
        )
    }

    pub fn switch_on(&mut self) -> Result<()> {
        self.write_controlword(controlword::SWITCH_ON)?;
        self.await_state(
            "SWITCHED_ON",
            status::is_switched_on,
            self.timing.state_attempts,
            self.timing.state_poll,
        )
    }

    pub fn enable_operation(&mut self) -> Result<()> {
        self.write_controlword(controlword::ENABLE_OPERATION)?;
        self.await_state(
            "OPERATION_ENABLED",
            status::is_operation_enabled,
            self.timing.state_attempts,
            self.timing.state_poll,
        )
    }

    /// Clear a latched fault by pulsing controlword bit 7.
    pub fn fault_reset(&mut self) -> Result<()> {
        for attempt in 1..=self.timing.fault_reset_attempts {
            let response = self.read_status()?;
            if status::is_no_error(&response) {
                if attempt > 1 {
                    info!("Drive fault cleared after {} pulse(s)", attempt - 1);
                }
                return Ok(());
            }

            warn!(
                attempt,
                "Drive in FAULT (statusword=0x{:04x}), pulsing fault reset", self.statusword
            );
            self.write_controlword(controlword::FAULT_RESET)?;
            self.settle(self.timing.fault_pulse);
            self.write_controlword(controlword::SHUTDOWN)?;
            self.settle(self.timing.fault_reset_delay);
        }

        let response = self.read_status()?;
        if status::is_no_error(&response) {
            return Ok(());
        }
        Err(DriveError::ResetFailed {
            statusword: self.statusword,
        })
    }

    /// Full recovery path: profile position mode, fault reset, then enable.
    pub fn initialize(&mut self) -> Result<()> {
        info!("Initializing drive");
        self.set_mode(OperationMode::ProfilePosition)?;
        self.fault_reset()?;
        self.shutdown()?;
        self.switch_on()?;
        self.enable_operation()?;
        self.settle(self.timing.post_init_settle);
        info!("Drive operation enabled (statusword=0x{:04x})", self.statusword);
        Ok(())
    }

    /// Run the homing procedure. Returns immediately when already homed.
    pub fn home(&mut self) -> Result<bool> {
        if self.is_homed()? {
            info!("Drive already homed");
            return Ok(true);
        }

        info!("Starting homing");
        let settle = self.timing.homing_settle;
        let params = self.homing;

        self.set_mode(OperationMode::Homing)?;
        self.settle(settle);
        if let Some(method) = params.method {
            self.write(frame::write_i8(object::HOMING_METHOD, 0, method))?;
            self.settle(settle);
        }
        let writes = [
            frame::write_i32(object::FEED_CONSTANT, 1, params.feed_constant),
            frame::write_u32(object::FEED_CONSTANT, 2, params.feed_revolutions),
            frame::write_i32(object::HOMING_SPEEDS, 1, params.switch_speed),
            frame::write_i32(object::HOMING_SPEEDS, 2, params.zero_speed),
            frame::write_i32(object::HOMING_ACCELERATION, 0, params.acceleration),
        ];
        for request in writes {
            self.write(request)?;
            self.settle(settle);
        }
        self.write_controlword(controlword::START)?;
        self.settle(settle);

        let mut guard = StuckGuard::new(self.timing.stuck_window);
        loop {
            self.settle(self.timing.poll_interval);
            let response = self.read_status()?;
            if status::is_fault(&response) {
                return Err(DriveError::Fault {
                    operation: "Homing",
                    statusword: self.statusword,
                });
            }

            let homing = self.read_homing_status()?;
            if status::is_homing_done(&homing, &response) {
                break;
            }

            let position = self.read_position()?;
            if guard.push(position) {
                return Err(DriveError::StuckPosition {
                    operation: "Homing",
                    position,
                });
            }
        }

        self.enable_operation()?;
        self.read_position()?;
        info!("Homing complete");
        Ok(true)
    }

    /// Profile-position move to `target`.
    ///
    /// The drive is reset and re-enabled before every move. After the target
    /// is reached the drive is shut down again.
    pub fn move_to_position(&mut self, target: i32, velocity: i32, acceleration: i32) -> Result<bool> {
        info!(velocity, acceleration, "Starting move to {}", target);
        self.fault_reset()?;
        self.initialize()?;

        let settle = self.timing.move_settle;
        self.write(frame::write_i32(object::PROFILE_VELOCITY, 0, velocity))?;
        self.settle(settle);
        self.write(frame::write_i32(object::PROFILE_ACCELERATION, 0, acceleration))?;
        self.settle(settle);
        self.write(frame::write_i32(object::TARGET_POSITION, 0, target))?;
        self.settle(settle);
        self.write_controlword(controlword::START)?;

        let mut guard = StuckGuard::new(self.timing.stuck_window);
        loop {
            self.settle(self.timing.poll_interval);
            let response = self.read_status()?;
            if status::is_fault(&response) {
                return Err(DriveError::Fault {
                    operation: "Move",
                    statusword: self.statusword,
                });
            }
            if status::is_moving_done(&response) {
                break;
            }

            let position = self.read_position()?;
            if guard.push(position) {
                return Err(DriveError::StuckPosition {
                    operation: "Move",
                    position,
                });
            }
        }

        let reached = self.read_position()?;
        debug!(reached, "Target reached");

        // The controller can keep bit 12 latched after shutdown until
        // operation is enabled once more.
        self.shutdown()?;
        for _ in 0..3 {
            let response = self.read_status()?;
            if !status::is_operation_mode_specific(&response) {
                break;
            }
            debug!("Operation mode specific bit still set, re-enabling operation");
            self.write_controlword(controlword::ENABLE_OPERATION)?;
            self.settle(self.timing.mode_bit_retry);
        }

        info!(position = reached, "Move complete");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingSleeper;
    use crate::sim::{SimOptions, SimulatedDrive};

    const POLL: Duration = Duration::from_millis(7);

    fn drive_for(sim: &SimulatedDrive, sleeper: &Arc<RecordingSleeper>) -> Drive {
        let timing = DriveTiming {
            poll_interval: POLL,
            ..DriveTiming::default()
        };
        Drive::new(
            Box::new(sim.link()),
            sleeper.clone(),
            timing,
            HomingParams::default(),
        )
    }

    #[test]
    fn test_stuck_guard_window() {
        let mut guard = StuckGuard::new(4);
        assert!(!guard.push(10));
        assert!(!guard.push(10));
        assert!(!guard.push(10));
        assert!(guard.push(10));

        let mut guard = StuckGuard::new(4);
        for p in [1, 2, 2, 2] {
            assert!(!guard.push(p));
        }
        assert!(guard.push(2));

        for window in [0, 1] {
            let mut guard = StuckGuard::new(window);
            assert!(!guard.push(5));
            assert!(guard.push(5));
        }
    }

    #[test]
    fn test_initialize_recovers_from_fault() {
        let sim = SimulatedDrive::new(SimOptions {
            start_in_fault: true,
            ..SimOptions::default()
        });
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut drive = drive_for(&sim, &sleeper);

        drive.initialize().unwrap();
        assert!(sim.controlwords().contains(&controlword::FAULT_RESET));
        assert_eq!(
            status::DriveState::from_statusword(drive.statusword()),
            status::DriveState::OperationEnabled
        );
    }

    #[test]
    fn test_fault_reset_gives_up() {
        let sim = SimulatedDrive::new(SimOptions {
            start_in_fault: true,
            latched_fault: true,
            ..SimOptions::default()
        });
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut drive = drive_for(&sim, &sleeper);

        let err = drive.fault_reset().unwrap_err();
        assert!(matches!(err, DriveError::ResetFailed { .. }));
        let pulses = sim
            .controlwords()
            .iter()
            .filter(|cw| **cw == controlword::FAULT_RESET)
            .count();
        assert_eq!(pulses, 5);
    }

    #[test]
    fn test_switch_on_times_out() {
        let sim = SimulatedDrive::new(SimOptions::default());
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut drive = drive_for(&sim, &sleeper);

        // Still SWITCH_ON_DISABLED: switch-on is not a valid transition.
        let err = drive.switch_on().unwrap_err();
        assert!(matches!(
            err,
            DriveError::StateTimeout {
                state: "SWITCHED_ON",
                ..
            }
        ));
        assert_eq!(sleeper.count(Duration::from_secs(1)), 3);
    }

    #[test]
    fn test_home_when_already_homed_only_reads_status() {
        let sim = SimulatedDrive::new(SimOptions {
            homed: true,
            ..SimOptions::default()
        });
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut drive = drive_for(&sim, &sleeper);
        drive.initialize().unwrap();

        let before = sim.frame_count();
        assert!(drive.home().unwrap());
        assert_eq!(sim.frame_count(), before + 1);
    }

    #[test]
    fn test_home_runs_procedure() {
        let sim = SimulatedDrive::new(SimOptions {
            initial_position: 12_000,
            ..SimOptions::default()
        });
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut drive = drive_for(&sim, &sleeper);
        drive.initialize().unwrap();

        assert!(drive.home().unwrap());
        assert!(sim.is_homed());
        assert_eq!(drive.position(), Some(0));
        assert_eq!(sim.writes_to(object::HOMING_SPEEDS, 1), vec![1000]);
        assert_eq!(sim.writes_to(object::FEED_CONSTANT, 1), vec![5400]);
        assert_eq!(sim.writes_to(object::MODES_OF_OPERATION, 0).last(), Some(&6));
    }

    #[test]
    fn test_home_detects_stuck_position() {
        let sim = SimulatedDrive::new(SimOptions {
            stuck: true,
            ..SimOptions::default()
        });
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut drive = drive_for(&sim, &sleeper);
        drive.initialize().unwrap();

        let err = drive.home().unwrap_err();
        assert!(matches!(
            err,
            DriveError::StuckPosition {
                operation: "Homing",
                ..
            }
        ));
        assert_eq!(sleeper.count(POLL), 4);
    }

    #[test]
    fn test_move_reaches_target() {
        let sim = SimulatedDrive::new(SimOptions {
            homed: true,
            initial_position: 0,
            step: 5_000,
            ..SimOptions::default()
        });
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut drive = drive_for(&sim, &sleeper);

        assert!(drive.move_to_position(30_000, 2000, 1000).unwrap());
        assert_eq!(drive.position(), Some(30_000));
        assert_eq!(sim.position(), 30_000);
        assert_eq!(sleeper.count(POLL), 6);
        assert_eq!(sim.writes_to(object::PROFILE_VELOCITY, 0), vec![2000]);
        assert_eq!(sim.writes_to(object::PROFILE_ACCELERATION, 0), vec![1000]);
        assert_eq!(sim.writes_to(object::TARGET_POSITION, 0), vec![30_000]);
        assert_eq!(sim.controlwords().last(), Some(&controlword::SHUTDOWN));
    }

    #[test]
    fn test_move_stuck_after_exactly_four_polls() {
        let sim = SimulatedDrive::new(SimOptions {
            homed: true,
            stuck: true,
            ..SimOptions::default()
        });
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut drive = drive_for(&sim, &sleeper);

        let err = drive.move_to_position(30_000, 2000, 1000).unwrap_err();
        match err {
            DriveError::StuckPosition {
                operation,
                position,
            } => {
                assert_eq!(operation, "Move");
                assert_eq!(position, SimOptions::default().initial_position);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sleeper.count(POLL), 4);
    }

    #[test]
    fn test_move_stuck_with_zero_window_still_stops() {
        let sim = SimulatedDrive::new(SimOptions {
            homed: true,
            stuck: true,
            ..SimOptions::default()
        });
        let sleeper = Arc::new(RecordingSleeper::new());
        let timing = DriveTiming {
            poll_interval: POLL,
            stuck_window: 0,
            ..DriveTiming::default()
        };
        let mut drive = Drive::new(
            Box::new(sim.link()),
            sleeper.clone(),
            timing,
            HomingParams::default(),
        );

        let err = drive.move_to_position(30_000, 2000, 1000).unwrap_err();
        assert!(matches!(err, DriveError::StuckPosition { .. }));
        assert_eq!(sleeper.count(POLL), 2);
    }

    #[test]
    fn test_move_fault_on_first_poll() {
        let sim = SimulatedDrive::new(SimOptions {
            homed: true,
            stuck: true,
            fault_on_motion: true,
            ..SimOptions::default()
        });
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut drive = drive_for(&sim, &sleeper);

        let err = drive.move_to_position(30_000, 2000, 1000).unwrap_err();
        assert!(matches!(err, DriveError::Fault { operation: "Move", .. }));
        assert_eq!(sleeper.count(POLL), 1);
    }

    #[test]
    fn test_move_clears_latched_mode_bit() {
        let sim = SimulatedDrive::new(SimOptions {
            homed: true,
            initial_position: 0,
            mode_bit_after_shutdown: true,
            ..SimOptions::default()
        });
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut drive = drive_for(&sim, &sleeper);

        drive.move_to_position(5_000, 2000, 1000).unwrap();
        assert_eq!(
            sim.controlwords().last(),
            Some(&controlword::ENABLE_OPERATION)
        );
    }

    #[test]
    fn test_connection_loss_propagates() {
        let sim = SimulatedDrive::new(SimOptions::default());
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut drive = drive_for(&sim, &sleeper);

        sim.drop_next_exchanges(1);
        let err = drive.initialize().unwrap_err();
        assert!(err.is_connection());
    }
}
