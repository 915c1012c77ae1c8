//! Application layer: the command engine, the protocol state machine, and
//! the session task that serialises access to both.

pub mod command_engine;
pub mod protocol;
pub mod session;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use nortek_core::protocol::ModeSentinel;
use nortek_core::{ConfigSnapshot, Frame, FrameError, RegistryError};

use crate::infrastructure::transport::TransportError;

pub use command_engine::{CommandEngine, Timing};
pub use protocol::Protocol;
pub use session::{start_session, SessionHandle};

/// Error type for protocol operations.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        timeout: Duration,
    },

    #[error("exchange cancelled by session shutdown")]
    Cancelled,

    #[error("could not determine instrument state")]
    UnknownInstrumentState,

    #[error("instrument rejected {command} with NACK")]
    Rejected { command: String },

    #[error("{event} is not valid in state {state}")]
    InvalidTransition {
        state: ProtocolState,
        event: &'static str,
    },

    #[error("invalid configuration blob: {0}")]
    InvalidBlob(String),

    #[error("session is not running")]
    SessionClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Where the instrument is believed to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolState {
    Unknown,
    Command,
    Autosample,
    DirectAccess,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::Unknown => "UNKNOWN",
            ProtocolState::Command => "COMMAND",
            ProtocolState::Autosample => "AUTOSAMPLE",
            ProtocolState::DirectAccess => "DIRECT_ACCESS",
        };
        f.write_str(name)
    }
}

/// Inputs to the protocol state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Discover,
    StartAutosample,
    StopAutosample,
    /// Battery voltage, clock, and hardware configuration in one pass.
    AcquireStatus,
    /// One `AD` sample while in command mode.
    AcquireSample,
    /// Power the instrument down.
    Reset,
    ClockSync,
    ReadClock,
    ReadMode,
    ReadBatteryVoltage,
    ReadId,
    ReadHardwareConfig,
    ReadHeadConfig,
    ReadUserConfig,
    /// Validate and write new parameter values.
    Set(ConfigSnapshot),
    /// Write a complete base64 user configuration block.
    SetConfiguration(String),
    /// Write init values that differ from the instrument's.
    ApplyStartupParams,
    StartDirectAccess,
    StopDirectAccess,
    ExecuteDirect(Vec<u8>),
    ScheduledClockSync,
    ScheduledAcquireStatus,
}

impl ProtocolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::Discover => "DISCOVER",
            ProtocolEvent::StartAutosample => "START_AUTOSAMPLE",
            ProtocolEvent::StopAutosample => "STOP_AUTOSAMPLE",
            ProtocolEvent::AcquireStatus => "ACQUIRE_STATUS",
            ProtocolEvent::AcquireSample => "ACQUIRE_SAMPLE",
            ProtocolEvent::Reset => "RESET",
            ProtocolEvent::ClockSync => "CLOCK_SYNC",
            ProtocolEvent::ReadClock => "READ_CLOCK",
            ProtocolEvent::ReadMode => "READ_MODE",
            ProtocolEvent::ReadBatteryVoltage => "READ_BATTERY_VOLTAGE",
            ProtocolEvent::ReadId => "READ_ID",
            ProtocolEvent::ReadHardwareConfig => "READ_HW_CONFIGURATION",
            ProtocolEvent::ReadHeadConfig => "READ_HEAD_CONFIGURATION",
            ProtocolEvent::ReadUserConfig => "READ_USER_CONFIGURATION",
            ProtocolEvent::Set(_) => "SET",
            ProtocolEvent::SetConfiguration(_) => "SET_CONFIGURATION",
            ProtocolEvent::ApplyStartupParams => "APPLY_STARTUP_PARAMS",
            ProtocolEvent::StartDirectAccess => "START_DIRECT",
            ProtocolEvent::StopDirectAccess => "STOP_DIRECT",
            ProtocolEvent::ExecuteDirect(_) => "EXECUTE_DIRECT",
            ProtocolEvent::ScheduledClockSync => "SCHEDULED_CLOCK_SYNC",
            ProtocolEvent::ScheduledAcquireStatus => "SCHEDULED_ACQUIRE_STATUS",
        }
    }
}

/// What an event handler returns besides the state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done,
    Frame(Frame),
    /// Battery, clock, and hardware configuration, in that order.
    Status(Vec<Frame>),
    /// Hardware mode word reported by `II`, if one was recognised.
    Mode(Option<ModeSentinel>),
}

/// Result of [`Protocol::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteResult {
    /// The new state, if the event changed it.
    pub next_state: Option<ProtocolState>,
    pub outcome: Outcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message_names_state_and_event() {
        let err = DriverError::InvalidTransition {
            state: ProtocolState::Autosample,
            event: ProtocolEvent::ReadClock.name(),
        };
        assert_eq!(err.to_string(), "READ_CLOCK is not valid in state AUTOSAMPLE");
    }

    #[test]
    fn test_timeout_message_names_what_was_awaited() {
        let err = DriverError::Timeout {
            waiting_for: "\"Confirm:\"".into(),
            timeout: Duration::from_secs(10),
        };
        assert!(err.to_string().contains("Confirm:"));
    }
}
