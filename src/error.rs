use thiserror::Error;

use crate::gpio::{PinId, PinMode};

#[derive(Debug, Clone, Error)]
pub enum GpioError {
    #[error("Invalid pin: {0}")]
    InvalidPin(PinId),
    #[error("Pin {0} is already claimed")]
    AlreadyClaimed(PinId),
    #[error("Mode {mode} is not supported by pin {pin}")]
    UnsupportedMode { pin: PinId, mode: PinMode },
    #[error("Pin {pin} is not writable in mode {mode}")]
    WriteNotPermitted { pin: PinId, mode: PinMode },
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Backend fault on pin {pin}: {reason}")]
    BackendFault { pin: PinId, reason: String },
    #[error("Pin {0} has been released")]
    Released(PinId),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GpioError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GpioError::AlreadyClaimed(_) | GpioError::BackendUnavailable(_)
        )
    }

    pub(crate) fn fault(pin: PinId, reason: impl Into<String>) -> Self {
        GpioError::BackendFault {
            pin,
            reason: reason.into(),
        }
    }
}

pub type GpioResult<T> = Result<T, GpioError>;
