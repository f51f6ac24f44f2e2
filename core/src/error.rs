use crate::state::LineState;
use thiserror::Error;

/// Failure reported by the hardware transport (ioctl, device read/write).
#[derive(Debug, Clone, Error, PartialEq)]
#[error("hardware I/O failed during {operation}: {message}")]
pub struct HardwareError {
    pub operation: &'static str,
    pub message: String,
}

impl HardwareError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// A transition the line state table does not allow.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid state transition: {from} -> {to}")]
pub struct StateTransitionError {
    pub from: LineState,
    pub to: LineState,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectionError {
    #[error("invalid audio frame: expected {expected} samples, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },

    #[error("invalid PCM payload: {0} bytes is not a whole number of 16-bit samples")]
    OddByteCount(usize),

    #[error("invalid DTMF digit: {0:?}")]
    InvalidDigit(char),
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid configuration for `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Error returned by line commands (ring, play audio, tone generation, ...).
#[derive(Debug, Error)]
pub enum LineError {
    #[error("cannot {command} while line is {state}")]
    InvalidState {
        command: &'static str,
        state: LineState,
    },

    #[error(transparent)]
    Transition(#[from] StateTransitionError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Coarse error class preserved end-to-end so callers can pick a response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    InvalidState,
    Hardware,
    InvalidInput,
}

impl LineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LineError::InvalidState { .. } | LineError::Transition(_) => ErrorClass::InvalidState,
            LineError::Hardware(_) => ErrorClass::Hardware,
            LineError::Detection(_) | LineError::Config(_) | LineError::InvalidArgument(_) => {
                ErrorClass::InvalidInput
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, LineError>;
