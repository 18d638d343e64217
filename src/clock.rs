//! Injectable delays for the drive state machine.

use parking_lot::Mutex;
use std::thread;
use std::time::Duration;

/// Blocking delay used between drive requests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Returns immediately and remembers every requested delay.
///
/// Test seam: hand it to [`Drive`](crate::Drive) or
/// [`LiftMotor::start`](crate::LiftMotor::start) to run the procedures
/// without real delays and to count the exact polls taken. Not meant for
/// driving hardware.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    calls: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// All delays requested so far, in order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().clone()
    }

    /// Number of delays equal to `duration`.
    pub fn count(&self, duration: Duration) -> usize {
        self.calls.lock().iter().filter(|d| **d == duration).count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.calls.lock().push(duration);
    }
}
