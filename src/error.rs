//! Error types for drive communication and control.

use crate::config::ConfigError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the transport, the drive state machine and the motor facade.
#[derive(Debug, Error)]
pub enum DriveError {
    /// Socket-level failure (connect, send or receive).
    #[error("connection error during {context}: {source}")]
    Connection {
        context: String,
        #[source]
        source: io::Error,
    },

    /// No live connection to the controller.
    #[error("not connected to drive")]
    Disconnected,

    /// Response too short to carry the requested payload.
    #[error("short response: expected at least {expected} bytes, got {actual}")]
    ShortResponse { expected: usize, actual: usize },

    /// Drive reported the fault bit while an operation was running.
    #[error("{operation} failed: drive in FAULT state (statusword=0x{statusword:04x})")]
    Fault {
        operation: &'static str,
        statusword: u16,
    },

    /// Consecutive position samples did not change while the drive reported no fault.
    #[error("{operation} failed: position stuck at {position}")]
    StuckPosition {
        operation: &'static str,
        position: i32,
    },

    /// A state transition was not observed within the allowed attempts.
    #[error("timeout waiting for {state} (statusword=0x{statusword:04x})")]
    StateTimeout {
        state: &'static str,
        statusword: u16,
    },

    /// Fault reset pulses exhausted without clearing the fault bit.
    #[error("reset faults failed (statusword=0x{statusword:04x})")]
    ResetFailed { statusword: u16 },

    /// Move requested before the axis was homed.
    #[error("movement impossible: homing required first")]
    NotHomed,

    /// Blocking call did not receive a result in time.
    #[error("operation timed out after {0:?}")]
    OperationTimedOut(Duration),

    /// Worker thread is gone; the command will never run.
    #[error("motor worker stopped")]
    WorkerStopped,

    /// Settings rejected before any thread was started.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl DriveError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Connection {
            context: context.into(),
            source,
        }
    }

    /// True for errors that invalidate the connection and call for a reconnect.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Disconnected | Self::ShortResponse { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DriveError>;
