//! igus dryve Lift Motor Control Library
//!
//! Drives the igus dryve D1 lift controller over CANopen-on-Modbus-TCP:
//! frame encoding, statusword decoding, the CiA 402 power state machine,
//! homing and profile-position moves, and a queued, thread-safe motor facade.
//!
//! ```no_run
//! use igus_lift_control::{LiftConfig, LiftMotor};
//! use std::time::Duration;
//!
//! # fn main() -> igus_lift_control::Result<()> {
//! let config = LiftConfig::default();
//! let motor = LiftMotor::connect(&config)?;
//! motor.wait_connected(Duration::from_secs(10));
//! motor.home(true)?;
//! motor.move_to_position(30_000, 2000, 1000, true)?;
//! println!("{:?}", motor.get_status());
//! motor.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod drive;
pub mod error;
pub mod frame;
pub mod motor;
pub mod sim;
pub mod status;
pub mod transport;
pub mod worker;

pub use clock::{RecordingSleeper, Sleeper, ThreadSleeper};
pub use config::{ConfigError, LiftConfig, MotionDefaults};
pub use drive::{Drive, DriveTiming, HomingParams, OperationMode};
pub use error::{DriveError, Result};
pub use motor::{LiftMotor, MotorState};
pub use sim::{SimOptions, SimulatedDrive};
pub use status::{DriveState, StatusWord};
pub use transport::{Connector, TcpConnector, TcpSettings, TcpTransport, Transport};
pub use worker::{Operation, WorkerSettings};
