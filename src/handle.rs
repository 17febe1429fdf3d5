use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{GpioError, GpioResult};
use crate::gpio::{PinId, PinMode, PinState};
use crate::registry::RegistryShared;

/// Exclusive access to one pin in one mode.
///
/// Output handles remember the last level written and report it from
/// [`read`](Self::read) instead of sampling the line. Dropping the handle
/// releases the claim.
pub struct PinHandle {
    shared: Arc<RegistryShared>,
    pin: PinId,
    mode: PinMode,
    claim: u64,
    // last level driven onto an output pin
    output: Mutex<bool>,
    disposed: AtomicBool,
}

impl PinHandle {
    pub(crate) fn new(
        shared: Arc<RegistryShared>,
        pin: PinId,
        mode: PinMode,
        claim: u64,
        initial: bool,
    ) -> Self {
        Self {
            shared,
            pin,
            mode,
            claim,
            output: Mutex::new(initial),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn pin(&self) -> PinId {
        self.pin
    }

    pub fn mode(&self) -> PinMode {
        self.mode
    }

    fn ensure_live(&self) -> GpioResult<()> {
        if self.disposed.load(Ordering::Acquire) || self.shared.is_shut_down() {
            return Err(GpioError::Released(self.pin));
        }
        Ok(())
    }

    fn track<T>(&self, result: GpioResult<T>) -> GpioResult<T> {
        if let Err(e) = &result {
            self.shared.note_error(e);
        }
        result
    }

    pub fn read(&self) -> GpioResult<bool> {
        self.ensure_live()?;
        match self.mode {
            PinMode::Output => Ok(*self.output.lock()),
            PinMode::Disabled => Err(GpioError::UnsupportedMode {
                pin: self.pin,
                mode: self.mode,
            }),
            _ => self.track(self.shared.backend.read_level(self.pin)),
        }
    }

    pub fn write(&self, level: bool) -> GpioResult<()> {
        self.ensure_live()?;
        if !self.mode.is_writable() {
            return Err(GpioError::WriteNotPermitted {
                pin: self.pin,
                mode: self.mode,
            });
        }
        let mut output = self.output.lock();
        self.track(self.shared.backend.write_level(self.pin, level))?;
        *output = level;
        Ok(())
    }

    /// Invert an output pin and return the new level.
    pub fn toggle(&self) -> GpioResult<bool> {
        self.ensure_live()?;
        if !self.mode.is_writable() {
            return Err(GpioError::WriteNotPermitted {
                pin: self.pin,
                mode: self.mode,
            });
        }
        let mut output = self.output.lock();
        let level = !*output;
        self.track(self.shared.backend.write_level(self.pin, level))?;
        *output = level;
        Ok(level)
    }

    /// Debounced state for input pins.
    pub fn state(&self) -> Option<PinState> {
        if !self.mode.is_input() {
            return None;
        }
        self.shared.pin_state(self.pin)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Release the claim. Safe to call repeatedly; only the first call acts.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.release_claim(self.pin, self.claim);
    }
}

impl fmt::Debug for PinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinHandle")
            .field("pin", &self.pin)
            .field("mode", &self.mode)
            .field("claim", &self.claim)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for PinHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
