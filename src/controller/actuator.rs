//! Valve and motor boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Discrete commands understood by the stand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActuatorCommand {
    OpenInlet,
    OpenOutlet,
    CloseBoth,
    MotorForward,
    MotorBackward,
    MotorStop,
}

impl fmt::Display for ActuatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenInlet => "open inlet",
            Self::OpenOutlet => "open outlet",
            Self::CloseBoth => "close both valves",
            Self::MotorForward => "motor forward",
            Self::MotorBackward => "motor backward",
            Self::MotorStop => "motor stop",
        };
        f.write_str(name)
    }
}

/// Valve position as reported (or inferred) by the stand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValveState {
    InletOpen,
    OutletOpen,
    BothClosed,
    /// No feedback yet, or feedback lost.
    Unknown,
}

impl ValveState {
    /// Operator-facing description for the status surface.
    pub fn description(&self) -> &'static str {
        match self {
            Self::InletOpen => "Inlet valve open",
            Self::OutletOpen => "Outlet valve open",
            Self::BothClosed => "Valves closed",
            Self::Unknown => "Valve state unknown",
        }
    }
}

impl fmt::Display for ValveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActuatorError {
    #[error("Actuator rejected '{command}': {reason}")]
    Rejected {
        command: ActuatorCommand,
        reason: String,
    },
    #[error("Actuator link lost")]
    Disconnected,
}

/// Motor and valve driver of the stand.
pub trait Actuator: Send + Sync {
    fn command(&self, command: ActuatorCommand) -> Result<(), ActuatorError>;

    /// Reported valve position; `None` when the stand gives no feedback.
    fn valve_feedback(&self) -> Option<ValveState>;
}
