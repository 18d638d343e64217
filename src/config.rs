//! TOML configuration for the lift controller.
//!
//! Every field has a default, so an empty file (or no file) yields a
//! working configuration for a controller on `127.0.0.1:502`.
//!
//! # TOML Example
//!
//! ```toml
//! [drive]
//! host = "192.168.1.230"
//! port = 502
//!
//! [timing]
//! poll_interval_ms = 500
//!
//! [homing]
//! switch_speed = 1000
//!
//! [worker]
//! command_timeout_ms = 120000
//! ```

use crate::drive::{DriveTiming, HomingParams};
use crate::transport::{TcpConnector, TcpSettings};
use crate::worker::WorkerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration: {0}")]
    ReadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiftConfig {
    pub drive: DriveSection,
    pub timing: TimingSection,
    pub homing: HomingParams,
    pub motion: MotionDefaults,
    pub worker: WorkerSection,
}

/// Controller address and socket timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveSection {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for DriveSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            connect_timeout_ms: 5000,
            io_timeout_ms: 5000,
        }
    }
}

/// Delays and bounded attempt counts of the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub poll_interval_ms: u64,
    pub homing_settle_ms: u64,
    pub move_settle_ms: u64,
    pub state_poll_ms: u64,
    pub state_attempts: u32,
    pub shutdown_poll_ms: u64,
    pub shutdown_attempts: u32,
    pub fault_reset_attempts: u32,
    pub fault_reset_delay_ms: u64,
    pub fault_pulse_ms: u64,
    pub post_init_settle_ms: u64,
    pub mode_bit_retry_ms: u64,
    pub stuck_window: usize,
}

impl Default for TimingSection {
    fn default() -> Self {
        let t = DriveTiming::default();
        Self {
            poll_interval_ms: ms(t.poll_interval),
            homing_settle_ms: ms(t.homing_settle),
            move_settle_ms: ms(t.move_settle),
            state_poll_ms: ms(t.state_poll),
            state_attempts: t.state_attempts,
            shutdown_poll_ms: ms(t.shutdown_poll),
            shutdown_attempts: t.shutdown_attempts,
            fault_reset_attempts: t.fault_reset_attempts,
            fault_reset_delay_ms: ms(t.fault_reset_delay),
            fault_pulse_ms: ms(t.fault_pulse),
            post_init_settle_ms: ms(t.post_init_settle),
            mode_bit_retry_ms: ms(t.mode_bit_retry),
            stuck_window: t.stuck_window,
        }
    }
}

/// Default profile parameters used when a caller omits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionDefaults {
    pub velocity: i32,
    pub acceleration: i32,
}

impl Default for MotionDefaults {
    fn default() -> Self {
        Self {
            velocity: 2000,
            acceleration: 2000,
        }
    }
}

/// Command queue and connection management.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    pub reconnect_interval_ms: u64,
    pub queue_poll_ms: u64,
    pub command_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub retry_on_disconnect: bool,
}

impl Default for WorkerSection {
    fn default() -> Self {
        let w = WorkerSettings::default();
        Self {
            connect_retries: w.connect_retries,
            retry_delay_ms: ms(w.retry_delay),
            reconnect_interval_ms: ms(w.reconnect_interval),
            queue_poll_ms: ms(w.queue_poll),
            command_timeout_ms: ms(w.command_timeout),
            join_timeout_ms: ms(w.join_timeout),
            retry_on_disconnect: w.retry_on_disconnect,
        }
    }
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl LiftConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.drive.host.trim().is_empty() {
            return fail("drive.host cannot be empty");
        }
        if self.drive.port == 0 {
            return fail("drive.port cannot be 0");
        }
        if self.timing.poll_interval_ms == 0 {
            return fail("timing.poll_interval_ms must be > 0");
        }
        if self.timing.state_attempts == 0
            || self.timing.shutdown_attempts == 0
            || self.timing.fault_reset_attempts == 0
        {
            return fail("timing attempt counts must be >= 1");
        }
        if self.timing.stuck_window < 2 {
            return fail("timing.stuck_window must be >= 2");
        }
        if self.homing.feed_revolutions == 0 {
            return fail("homing.feed_revolutions must be >= 1");
        }
        if self.motion.velocity <= 0 || self.motion.acceleration <= 0 {
            return fail("motion defaults must be positive");
        }
        if self.worker.connect_retries == 0 {
            return fail("worker.connect_retries must be >= 1");
        }
        if self.worker.queue_poll_ms == 0 || self.worker.command_timeout_ms == 0 {
            return fail("worker.queue_poll_ms and worker.command_timeout_ms must be > 0");
        }
        Ok(())
    }

    pub fn tcp_settings(&self) -> TcpSettings {
        TcpSettings {
            connect_timeout: Duration::from_millis(self.drive.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.drive.io_timeout_ms),
        }
    }

    pub fn connector(&self) -> TcpConnector {
        TcpConnector::new(self.drive.host.clone(), self.drive.port, self.tcp_settings())
    }

    pub fn drive_timing(&self) -> DriveTiming {
        let t = &self.timing;
        DriveTiming {
            poll_interval: Duration::from_millis(t.poll_interval_ms),
            homing_settle: Duration::from_millis(t.homing_settle_ms),
            move_settle: Duration::from_millis(t.move_settle_ms),
            state_poll: Duration::from_millis(t.state_poll_ms),
            state_attempts: t.state_attempts,
            shutdown_poll: Duration::from_millis(t.shutdown_poll_ms),
            shutdown_attempts: t.shutdown_attempts,
            fault_reset_attempts: t.fault_reset_attempts,
            fault_reset_delay: Duration::from_millis(t.fault_reset_delay_ms),
            fault_pulse: Duration::from_millis(t.fault_pulse_ms),
            post_init_settle: Duration::from_millis(t.post_init_settle_ms),
            mode_bit_retry: Duration::from_millis(t.mode_bit_retry_ms),
            stuck_window: t.stuck_window,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let w = &self.worker;
        WorkerSettings {
            connect_retries: w.connect_retries,
            retry_delay: Duration::from_millis(w.retry_delay_ms),
            reconnect_interval: Duration::from_millis(w.reconnect_interval_ms),
            queue_poll: Duration::from_millis(w.queue_poll_ms),
            command_timeout: Duration::from_millis(w.command_timeout_ms),
            join_timeout: Duration::from_millis(w.join_timeout_ms),
            retry_on_disconnect: w.retry_on_disconnect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = LiftConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.drive.port, 502);
        assert_eq!(config.timing.stuck_window, 4);
        assert_eq!(config.drive_timing(), DriveTiming::default());
        assert_eq!(config.worker_settings(), WorkerSettings::default());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = LiftConfig::from_toml("").unwrap();
        assert_eq!(config, LiftConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = LiftConfig::from_toml(
            r#"
            [drive]
            host = "192.168.1.230"

            [timing]
            poll_interval_ms = 250

            [homing]
            method = 17
            "#,
        )
        .unwrap();
        assert_eq!(config.drive.host, "192.168.1.230");
        assert_eq!(config.drive.port, 502);
        assert_eq!(config.drive_timing().poll_interval, Duration::from_millis(250));
        assert_eq!(config.homing.method, Some(17));
        assert_eq!(config.homing.switch_speed, 1000);
    }

    #[test]
    fn test_validation_errors() {
        let err = LiftConfig::from_toml("[drive]\nport = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = LiftConfig::from_toml("[timing]\nstuck_window = 1\n").unwrap_err();
        assert!(err.to_string().contains("stuck_window"));

        let err = LiftConfig::from_toml("[drive\nhost=").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\ncommand_timeout_ms = 1500").unwrap();

        let config = LiftConfig::load(file.path()).unwrap();
        assert_eq!(
            config.worker_settings().command_timeout,
            Duration::from_millis(1500)
        );

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            LiftConfig::load(&missing),
            Err(ConfigError::FileNotFound(_))
        ));
    }
}
