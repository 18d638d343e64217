//! In-process dryve controller for tests and `--simulate` runs.
//!
//! Answers the same telegrams as the real controller and walks a reduced
//! CiA 402 state machine. Motion advances by a fixed step on every statusword
//! read, so the number of polls a move takes is deterministic.

use crate::error::{DriveError, Result};
use crate::frame::{object, Access, HEADER_LEN, LENGTH_OFFSET};
use crate::transport::{Connector, Transport};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Behaviour knobs of the simulated controller.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Power up with the fault bit latched.
    pub start_in_fault: bool,
    /// Fault reset pulses never clear the fault.
    pub latched_fault: bool,
    pub homed: bool,
    pub initial_position: i32,
    /// Position change per statusword read while moving or homing.
    pub step: i32,
    /// Position never changes and targets are never reached.
    pub stuck: bool,
    /// Raise a fault as soon as motion starts.
    pub fault_on_motion: bool,
    /// Keep statusword bit 12 set after the post-move shutdown until
    /// operation is enabled again.
    pub mode_bit_after_shutdown: bool,
    /// Refuse this many connection attempts before accepting.
    pub refused_connections: usize,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            start_in_fault: false,
            latched_fault: false,
            homed: false,
            initial_position: 12_000,
            step: 5_000,
            stuck: false,
            fault_on_motion: false,
            mode_bit_after_shutdown: false,
            refused_connections: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PowerState {
    Fault,
    SwitchOnDisabled,
    ReadyToSwitchOn,
    SwitchedOn,
    OperationEnabled,
}

#[derive(Debug)]
struct SimState {
    options: SimOptions,
    power: PowerState,
    mode: i8,
    position: i32,
    target: i32,
    pending_target: i32,
    profile_velocity: i32,
    moving: bool,
    homing: bool,
    homed: bool,
    move_completed: bool,
    mode_bit_latched: bool,
    refusals_left: usize,
    dropped_exchanges: usize,
    connections: usize,
    frames: Vec<Vec<u8>>,
}

impl SimState {
    fn new(options: SimOptions) -> Self {
        Self {
            power: if options.start_in_fault {
                PowerState::Fault
            } else {
                PowerState::SwitchOnDisabled
            },
            mode: 0,
            position: options.initial_position,
            target: options.initial_position,
            pending_target: options.initial_position,
            profile_velocity: 0,
            moving: false,
            homing: false,
            homed: options.homed,
            move_completed: false,
            mode_bit_latched: false,
            refusals_left: options.refused_connections,
            dropped_exchanges: 0,
            connections: 0,
            frames: Vec::new(),
            options,
        }
    }

    fn statusword(&self) -> u16 {
        let mut sw = match self.power {
            PowerState::Fault => 0x0008,
            PowerState::SwitchOnDisabled => 0x0040,
            PowerState::ReadyToSwitchOn => 0x0221,
            PowerState::SwitchedOn => 0x0223,
            PowerState::OperationEnabled => 0x0227,
        };
        if self.power == PowerState::OperationEnabled {
            if self.mode == 1 && !self.moving {
                sw |= 0x0400;
            }
            if self.mode == 6 && self.homed && !self.homing {
                sw |= 0x1400;
            }
        }
        if self.mode_bit_latched {
            sw |= 0x1000;
        }
        sw
    }

    fn advance(&mut self) {
        if self.options.stuck {
            return;
        }
        let step = self.options.step.max(1);
        if self.moving {
            self.position = step_toward(self.position, self.target, step);
            if self.position == self.target {
                self.moving = false;
                self.move_completed = true;
            }
        }
        if self.homing {
            self.position = step_toward(self.position, 0, step);
            if self.position == 0 {
                self.homing = false;
                self.homed = true;
            }
        }
    }

    fn start_motion(&mut self) {
        if self.options.fault_on_motion {
            self.power = PowerState::Fault;
            self.moving = false;
            self.homing = false;
            return;
        }
        match self.mode {
            1 => {
                self.target = self.pending_target;
                self.moving = true;
                self.move_completed = false;
            }
            6 => {
                self.homing = true;
                self.homed = false;
            }
            _ => {}
        }
    }

    fn apply_controlword(&mut self, cw: u16) {
        if cw & 0x0080 != 0 {
            if self.power == PowerState::Fault && !self.options.latched_fault {
                self.power = PowerState::SwitchOnDisabled;
            }
            return;
        }
        if self.power == PowerState::Fault {
            return;
        }
        match cw & 0x000F {
            0x0006 => {
                self.power = PowerState::ReadyToSwitchOn;
                self.moving = false;
                self.homing = false;
                if self.options.mode_bit_after_shutdown && self.move_completed {
                    self.mode_bit_latched = true;
                    self.move_completed = false;
                }
            }
            0x0007 => {
                if matches!(
                    self.power,
                    PowerState::ReadyToSwitchOn
                        | PowerState::SwitchedOn
                        | PowerState::OperationEnabled
                ) {
                    self.power = PowerState::SwitchedOn;
                }
            }
            0x000F => {
                if matches!(
                    self.power,
                    PowerState::ReadyToSwitchOn
                        | PowerState::SwitchedOn
                        | PowerState::OperationEnabled
                ) {
                    self.power = PowerState::OperationEnabled;
                    self.mode_bit_latched = false;
                    if cw & 0x0010 != 0 {
                        self.start_motion();
                    }
                }
            }
            _ => {}
        }
    }

    fn write(&mut self, index: u16, data: &[u8]) {
        match index {
            object::CONTROLWORD => self.apply_controlword(le_u16(data)),
            object::MODES_OF_OPERATION => self.mode = data.first().map_or(0, |b| *b as i8),
            object::TARGET_POSITION => self.pending_target = le_i32(data),
            object::PROFILE_VELOCITY => self.profile_velocity = le_i32(data),
            _ => {}
        }
    }

    fn read(&mut self, index: u16) -> Vec<u8> {
        match index {
            object::STATUSWORD => {
                self.advance();
                self.statusword().to_le_bytes().to_vec()
            }
            object::POSITION_ACTUAL => self.position.to_le_bytes().to_vec(),
            object::VELOCITY_ACTUAL => {
                let v = if self.moving || self.homing {
                    self.profile_velocity
                } else {
                    0
                };
                v.to_le_bytes().to_vec()
            }
            object::HOMING_STATUS => vec![u8::from(self.homed), 0],
            object::MODES_OF_OPERATION_DISPLAY => vec![self.mode as u8],
            object::DIGITAL_INPUTS => {
                let home_switch: u32 = if self.position <= 0 { 0x0004 } else { 0 };
                home_switch.to_le_bytes().to_vec()
            }
            _ => Vec::new(),
        }
    }

    fn handle(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.frames.push(request.to_vec());
        if self.dropped_exchanges > 0 {
            self.dropped_exchanges -= 1;
            return Err(DriveError::io(
                "recv",
                io::Error::new(io::ErrorKind::ConnectionReset, "simulated link drop"),
            ));
        }
        if request.len() < HEADER_LEN {
            return Ok(request.to_vec());
        }

        let index = u16::from_be_bytes([request[12], request[13]]);
        if request[9] == Access::Write as u8 {
            self.write(index, &request[HEADER_LEN..]);
            return Ok(request.to_vec());
        }

        let len = usize::from(request[HEADER_LEN - 1]);
        let mut data = self.read(index);
        data.resize(len, 0);
        let mut response = request[..HEADER_LEN].to_vec();
        response.extend_from_slice(&data);
        response[LENGTH_OFFSET] = (response.len() - (LENGTH_OFFSET + 1)) as u8;
        Ok(response)
    }
}

fn step_toward(position: i32, goal: i32, step: i32) -> i32 {
    if (goal - position).abs() <= step {
        goal
    } else {
        position + step * (goal - position).signum()
    }
}

fn le_u16(data: &[u8]) -> u16 {
    let mut bytes = [0u8; 2];
    for (dst, src) in bytes.iter_mut().zip(data) {
        *dst = *src;
    }
    u16::from_le_bytes(bytes)
}

/// Sign-extending little-endian decode of up to four bytes.
fn le_i32(data: &[u8]) -> i32 {
    match data.len() {
        0 => 0,
        1 => i32::from(data[0] as i8),
        2 => i32::from(i16::from_le_bytes([data[0], data[1]])),
        _ => {
            let mut bytes = [0u8; 4];
            for (dst, src) in bytes.iter_mut().zip(data) {
                *dst = *src;
            }
            i32::from_le_bytes(bytes)
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<SimState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Handle to a simulated controller. Clones share the same device.
#[derive(Debug, Clone)]
pub struct SimulatedDrive {
    inner: Arc<Inner>,
}

impl SimulatedDrive {
    pub fn new(options: SimOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SimState::new(options)),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Open a link directly, bypassing refusal accounting.
    pub fn link(&self) -> SimLink {
        self.inner.state.lock().connections += 1;
        SimLink {
            drive: self.clone(),
            open: true,
        }
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().frames.clone()
    }

    pub fn frame_count(&self) -> usize {
        self.inner.state.lock().frames.len()
    }

    /// Values written to `object`/`sub_index`, in order.
    pub fn writes_to(&self, index: u16, sub_index: u8) -> Vec<i32> {
        let [hi, lo] = index.to_be_bytes();
        self.inner
            .state
            .lock()
            .frames
            .iter()
            .filter(|f| {
                f.len() >= HEADER_LEN
                    && f[9] == Access::Write as u8
                    && f[12] == hi
                    && f[13] == lo
                    && f[14] == sub_index
            })
            .map(|f| le_i32(&f[HEADER_LEN..]))
            .collect()
    }

    pub fn controlwords(&self) -> Vec<u16> {
        self.writes_to(object::CONTROLWORD, 0)
            .into_iter()
            .map(|v| v as u16)
            .collect()
    }

    pub fn position(&self) -> i32 {
        self.inner.state.lock().position
    }

    pub fn is_homed(&self) -> bool {
        self.inner.state.lock().homed
    }

    pub fn statusword(&self) -> u16 {
        self.inner.state.lock().statusword()
    }

    /// Links opened so far.
    pub fn connections(&self) -> usize {
        self.inner.state.lock().connections
    }

    /// Highest number of exchanges observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Latch a fault as if the controller tripped.
    pub fn inject_fault(&self) {
        let mut state = self.inner.state.lock();
        state.power = PowerState::Fault;
        state.moving = false;
        state.homing = false;
    }

    /// Fail the next `count` exchanges with a connection reset.
    pub fn drop_next_exchanges(&self, count: usize) {
        self.inner.state.lock().dropped_exchanges = count;
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: usize) {
        self.inner.state.lock().refusals_left = count;
    }

    pub fn set_stuck(&self, stuck: bool) {
        self.inner.state.lock().options.stuck = stuck;
    }

    fn exchange(&self, request: &[u8]) -> Result<Vec<u8>> {
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.inner.state.lock().handle(request);
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl Connector for SimulatedDrive {
    fn connect(&self) -> Result<Box<dyn Transport>> {
        {
            let mut state = self.inner.state.lock();
            if state.refusals_left > 0 {
                state.refusals_left -= 1;
                return Err(DriveError::io(
                    "connect simulated drive",
                    io::Error::from(io::ErrorKind::ConnectionRefused),
                ));
            }
        }
        Ok(Box::new(self.link()))
    }

    fn describe(&self) -> String {
        "simulated dryve".to_string()
    }
}

/// One open connection to a [`SimulatedDrive`].
#[derive(Debug)]
pub struct SimLink {
    drive: SimulatedDrive,
    open: bool,
}

impl Transport for SimLink {
    fn send_and_receive(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if !self.open {
            return Err(DriveError::Disconnected);
        }
        let response = self.drive.exchange(frame)?;
        trace!(tx = ?frame, rx = ?response, "simulated exchange");
        Ok(response)
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{self, controlword};
    use crate::status;

    #[test]
    fn test_power_state_walk() {
        let sim = SimulatedDrive::new(SimOptions {
            start_in_fault: true,
            ..SimOptions::default()
        });
        let mut link = sim.link();

        let r = link.send_and_receive(&frame::statusword_request()).unwrap();
        assert_eq!(r.len(), 21);
        assert!(status::is_fault(&r));

        for cw in [
            controlword::FAULT_RESET,
            controlword::SHUTDOWN,
            controlword::SWITCH_ON,
            controlword::ENABLE_OPERATION,
        ] {
            let echo = link.send_and_receive(&frame::controlword_frame(cw)).unwrap();
            assert_eq!(echo, frame::controlword_frame(cw));
        }
        let r = link.send_and_receive(&frame::statusword_request()).unwrap();
        assert!(status::is_operation_enabled(&r));
        assert_eq!(sim.controlwords().len(), 4);
    }

    #[test]
    fn test_position_read_layout() {
        let sim = SimulatedDrive::new(SimOptions {
            initial_position: -1500,
            ..SimOptions::default()
        });
        let mut link = sim.link();
        let r = link
            .send_and_receive(&frame::read_request(object::POSITION_ACTUAL, 0, 4))
            .unwrap();
        assert_eq!(r.len(), 23);
        assert_eq!(r[LENGTH_OFFSET] as usize, r.len() - 6);
        assert_eq!(frame::payload_i32(&r).unwrap(), -1500);
    }

    #[test]
    fn test_refused_connections_then_accept() {
        let sim = SimulatedDrive::new(SimOptions {
            refused_connections: 2,
            ..SimOptions::default()
        });
        assert!(sim.connect().is_err());
        assert!(sim.connect().is_err());
        assert!(sim.connect().is_ok());
        assert_eq!(sim.connections(), 1);
    }

    #[test]
    fn test_closed_link_rejects_exchanges() {
        let sim = SimulatedDrive::new(SimOptions::default());
        let mut link = sim.link();
        link.close();
        assert!(matches!(
            link.send_and_receive(&frame::statusword_request()),
            Err(DriveError::Disconnected)
        ));
    }
}
