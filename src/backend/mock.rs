use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;

use crate::error::{GpioError, GpioResult};
use crate::gpio::{GpioBackend, PinId, PinMode, RawSink, RawWatch};

pub(crate) const MOCK_DEFAULT_LINES: u32 = 28;

/// Failure a test can inject into a mock pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Unavailable,
    Fault,
}

/// In-memory backend for tests and host development.
///
/// Levels of input pins are driven from the outside with
/// [`set_input_level`](MockGpioBackend::set_input_level). The default flavour
/// pushes every change to the sampler like an interrupt-capable driver;
/// [`polling`](MockGpioBackend::polling) makes the sampler poll instead.
#[derive(Clone)]
pub struct MockGpioBackend {
    inner: Arc<MockInner>,
}

struct MockInner {
    lines: u32,
    interrupts: bool,
    pins: RwLock<FxHashMap<PinId, Mutex<MockPinState>>>, // keyed by pin id
    unsupported: RwLock<HashSet<(PinId, PinMode)>>,
}

struct MockPinState {
    mode: PinMode,
    level: bool,
    sink: Option<(u64, RawSink)>,
    next_token: u64,
    failure: Option<MockFailure>,
    reads: u64,
    writes: u64,
}

impl Default for MockPinState {
    fn default() -> Self {
        Self {
            mode: PinMode::Disabled,
            level: false,
            sink: None,
            next_token: 0,
            failure: None,
            reads: 0,
            writes: 0,
        }
    }
}

impl Default for MockGpioBackend {
    fn default() -> Self {
        Self::new(MOCK_DEFAULT_LINES)
    }
}

fn poisoned<E: std::fmt::Display>(pin: PinId, e: E) -> GpioError {
    GpioError::fault(pin, format!("lock poisoned: {e}"))
}

impl MockGpioBackend {
    pub fn new(lines: u32) -> Self {
        Self::build(lines, true)
    }

    pub fn polling(lines: u32) -> Self {
        Self::build(lines, false)
    }

    fn build(lines: u32, interrupts: bool) -> Self {
        Self {
            inner: Arc::new(MockInner {
                lines,
                interrupts,
                pins: RwLock::new(FxHashMap::default()),
                unsupported: RwLock::new(HashSet::new()),
            }),
        }
    }

    fn with_pin<T>(&self, pin: PinId, f: impl FnOnce(&mut MockPinState) -> T) -> GpioResult<T> {
        if pin.as_u32() >= self.inner.lines {
            return Err(GpioError::InvalidPin(pin));
        }
        {
            let pins = self.inner.pins.read().map_err(|e| poisoned(pin, e))?;
            if let Some(state) = pins.get(&pin) {
                let mut state = state.lock().map_err(|e| poisoned(pin, e))?;
                return Ok(f(&mut state));
            }
        }
        let mut pins = self.inner.pins.write().map_err(|e| poisoned(pin, e))?;
        let entry = pins.entry(pin).or_insert_with(|| Mutex::new(MockPinState::default()));
        let mut state = entry.lock().map_err(|e| poisoned(pin, e))?;
        Ok(f(&mut state))
    }

    fn check_failure(pin: PinId, state: &MockPinState) -> GpioResult<()> {
        match state.failure {
            None => Ok(()),
            Some(MockFailure::Unavailable) => Err(GpioError::BackendUnavailable(format!(
                "mock pin {pin} not responding"
            ))),
            Some(MockFailure::Fault) => Err(GpioError::fault(pin, "mock returned garbage")),
        }
    }

    /// Simulate the outside world driving `pin` to `level`.
    pub fn set_input_level(&self, pin: PinId, level: bool) -> GpioResult<()> {
        self.with_pin(pin, |state| {
            state.level = level;
            if let Some((_, sink)) = &state.sink {
                sink.push(level);
            }
        })
    }

    /// Inject a persistent failure; `None` heals the pin.
    pub fn set_failure(&self, pin: PinId, failure: Option<MockFailure>) -> GpioResult<()> {
        self.with_pin(pin, |state| {
            state.failure = failure;
            if let (Some(MockFailure::Fault), Some((_, sink))) = (failure, &state.sink) {
                sink.report(GpioError::fault(pin, "mock interrupt line broke"));
            }
        })
    }

    pub fn disallow(&self, pin: PinId, mode: PinMode) {
        if let Ok(mut unsupported) = self.inner.unsupported.write() {
            unsupported.insert((pin, mode));
        }
    }

    pub fn mode(&self, pin: PinId) -> GpioResult<PinMode> {
        self.with_pin(pin, |state| state.mode)
    }

    pub fn level(&self, pin: PinId) -> GpioResult<bool> {
        self.with_pin(pin, |state| state.level)
    }

    pub fn read_count(&self, pin: PinId) -> GpioResult<u64> {
        self.with_pin(pin, |state| state.reads)
    }

    pub fn write_count(&self, pin: PinId) -> GpioResult<u64> {
        self.with_pin(pin, |state| state.writes)
    }

    pub fn has_raw_subscriber(&self, pin: PinId) -> GpioResult<bool> {
        self.with_pin(pin, |state| state.sink.is_some())
    }
}

struct MockWatch {
    backend: MockGpioBackend,
    pin: PinId,
    token: u64,
}

impl Drop for MockWatch {
    fn drop(&mut self) {
        let token = self.token;
        let _ = self.backend.with_pin(self.pin, |state| {
            if matches!(state.sink, Some((t, _)) if t == token) {
                state.sink = None;
            }
        });
    }
}

impl GpioBackend for MockGpioBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn lines(&self) -> GpioResult<Vec<PinId>> {
        Ok((0..self.inner.lines).map(PinId).collect())
    }

    fn supports(&self, pin: PinId, mode: PinMode) -> bool {
        pin.as_u32() < self.inner.lines
            && self
                .inner
                .unsupported
                .read()
                .map(|u| !u.contains(&(pin, mode)))
                .unwrap_or(false)
    }

    fn configure(&self, pin: PinId, mode: PinMode) -> GpioResult<()> {
        self.with_pin(pin, |state| {
            Self::check_failure(pin, state)?;
            state.mode = mode;
            match mode {
                PinMode::InputPullUp => state.level = true,
                PinMode::InputPullDown | PinMode::Disabled => state.level = false,
                PinMode::Input | PinMode::Output => {}
            }
            Ok(())
        })?
    }

    fn read_level(&self, pin: PinId) -> GpioResult<bool> {
        self.with_pin(pin, |state| {
            Self::check_failure(pin, state)?;
            if state.mode == PinMode::Disabled {
                return Err(GpioError::UnsupportedMode {
                    pin,
                    mode: PinMode::Disabled,
                });
            }
            state.reads += 1;
            Ok(state.level)
        })?
    }

    fn write_level(&self, pin: PinId, level: bool) -> GpioResult<()> {
        self.with_pin(pin, |state| {
            Self::check_failure(pin, state)?;
            if !state.mode.is_writable() {
                return Err(GpioError::WriteNotPermitted {
                    pin,
                    mode: state.mode,
                });
            }
            state.writes += 1;
            state.level = level;
            Ok(())
        })?
    }

    fn subscribe_raw(&self, pin: PinId, sink: RawSink) -> GpioResult<Option<RawWatch>> {
        if !self.inner.interrupts {
            return Ok(None);
        }
        let token = self.with_pin(pin, |state| {
            Self::check_failure(pin, state)?;
            state.next_token += 1;
            state.sink = Some((state.next_token, sink));
            Ok(state.next_token)
        })??;
        Ok(Some(RawWatch::new(MockWatch {
            backend: self.clone(),
            pin,
            token,
        })))
    }

    fn release(&self, pin: PinId) -> GpioResult<()> {
        self.with_pin(pin, |state| {
            state.mode = PinMode::Disabled;
            state.sink = None;
        })
    }
}
