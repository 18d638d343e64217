//! Statusword decoding and status predicates.
//!
//! Predicates take the raw response buffer and never fail: anything too short
//! to decode answers `false`.

use crate::frame::{decode_statusword, HEADER_LEN};
use bitflags::bitflags;

bitflags! {
    /// CiA 402 statusword bits (object 0x6041).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusWord: u16 {
        const READY_TO_SWITCH_ON      = 0x0001;
        const SWITCHED_ON             = 0x0002;
        const OPERATION_ENABLED       = 0x0004;
        const FAULT                   = 0x0008;
        const VOLTAGE_ENABLED         = 0x0010;
        const QUICK_STOP              = 0x0020;
        const SWITCH_ON_DISABLED      = 0x0040;
        const WARNING                 = 0x0080;
        const REMOTE                  = 0x0200;
        const TARGET_REACHED          = 0x0400;
        const INTERNAL_LIMIT_ACTIVE   = 0x0800;
        /// Homing attained in homing mode, set-point acknowledge in profile position mode.
        const OPERATION_MODE_SPECIFIC = 0x1000;
        const HOMING_ERROR            = 0x2000;
    }
}

impl Default for StatusWord {
    fn default() -> Self {
        Self::empty()
    }
}

impl StatusWord {
    /// Decode from the tail of a response buffer.
    pub fn from_response(response: &[u8]) -> Option<Self> {
        decode_statusword(response).map(Self::from_bits_retain)
    }

    /// CiA 402 device state encoded by this statusword.
    pub fn state(self) -> DriveState {
        DriveState::from_statusword(self.bits())
    }
}

/// Device states of the CiA 402 power state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    NotReadyToSwitchOn,
    SwitchOnDisabled,
    ReadyToSwitchOn,
    SwitchedOn,
    OperationEnabled,
    QuickStopActive,
    FaultReactionActive,
    Fault,
    Unknown,
}

impl DriveState {
    pub fn from_statusword(sw: u16) -> Self {
        match (sw & 0x004F, sw & 0x006F) {
            (0x0000, _) => Self::NotReadyToSwitchOn,
            (0x0040, _) => Self::SwitchOnDisabled,
            (0x000F, _) => Self::FaultReactionActive,
            (0x0008, _) => Self::Fault,
            (_, 0x0021) => Self::ReadyToSwitchOn,
            (_, 0x0023) => Self::SwitchedOn,
            (_, 0x0027) => Self::OperationEnabled,
            (_, 0x0007) => Self::QuickStopActive,
            _ => Self::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NotReadyToSwitchOn => "NOT_READY_TO_SWITCH_ON",
            Self::SwitchOnDisabled => "SWITCH_ON_DISABLED",
            Self::ReadyToSwitchOn => "READY_TO_SWITCH_ON",
            Self::SwitchedOn => "SWITCHED_ON",
            Self::OperationEnabled => "OPERATION_ENABLED",
            Self::QuickStopActive => "QUICK_STOP_ACTIVE",
            Self::FaultReactionActive => "FAULT_REACTION_ACTIVE",
            Self::Fault => "FAULT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Low statusword byte values the controller reports once a shutdown completed.
const SHUTDOWN_PATTERNS: [u8; 3] = [6, 33, 2];

fn has(response: &[u8], bit: StatusWord) -> bool {
    StatusWord::from_response(response).is_some_and(|sw| sw.contains(bit))
}

pub fn is_ready_to_switch_on(response: &[u8]) -> bool {
    has(response, StatusWord::READY_TO_SWITCH_ON)
}

pub fn is_switched_on(response: &[u8]) -> bool {
    has(response, StatusWord::SWITCHED_ON)
}

pub fn is_operation_enabled(response: &[u8]) -> bool {
    has(response, StatusWord::OPERATION_ENABLED)
}

pub fn is_fault(response: &[u8]) -> bool {
    has(response, StatusWord::FAULT)
}

pub fn is_voltage_enabled(response: &[u8]) -> bool {
    has(response, StatusWord::VOLTAGE_ENABLED)
}

pub fn is_quick_stop(response: &[u8]) -> bool {
    has(response, StatusWord::QUICK_STOP)
}

pub fn is_switch_on_disabled(response: &[u8]) -> bool {
    has(response, StatusWord::SWITCH_ON_DISABLED)
}

pub fn is_warning(response: &[u8]) -> bool {
    has(response, StatusWord::WARNING)
}

pub fn is_target_reached(response: &[u8]) -> bool {
    has(response, StatusWord::TARGET_REACHED)
}

pub fn is_internal_limit_active(response: &[u8]) -> bool {
    has(response, StatusWord::INTERNAL_LIMIT_ACTIVE)
}

pub fn is_homing_error(response: &[u8]) -> bool {
    has(response, StatusWord::HOMING_ERROR)
}

pub fn is_operation_mode_specific(response: &[u8]) -> bool {
    has(response, StatusWord::OPERATION_MODE_SPECIFIC)
}

/// Homing attained, read from the manufacturer homing-status object (0x2014).
///
/// Bit 0 of the first payload byte; the response must carry the full
/// two-byte payload.
pub fn is_homing_attained(response: &[u8]) -> bool {
    response.len() > HEADER_LEN + 1 && response[response.len() - 2] & 0x01 != 0
}

/// Shutdown completed: the low statusword byte matches a known pattern.
pub fn is_shutdown(response: &[u8]) -> bool {
    response
        .get(HEADER_LEN)
        .is_some_and(|low| SHUTDOWN_PATTERNS.contains(low))
}

/// Statusword decodes and the fault bit is clear.
pub fn is_no_error(response: &[u8]) -> bool {
    StatusWord::from_response(response).is_some_and(|sw| !sw.contains(StatusWord::FAULT))
}

pub fn is_moving_done(response: &[u8]) -> bool {
    is_target_reached(response)
}

/// Target not reached and no fault.
pub fn is_moving(response: &[u8]) -> bool {
    StatusWord::from_response(response).is_some_and(|sw| {
        !sw.intersects(StatusWord::TARGET_REACHED | StatusWord::FAULT)
    })
}

pub fn is_homing_done(homing_response: &[u8], status_response: &[u8]) -> bool {
    is_homing_attained(homing_response) && is_no_error(status_response)
}
