use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::time::{Duration, Instant};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{GpioError, GpioResult};

/// Physical pin number as understood by the active backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PinId(pub u32);

impl PinId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for PinId {
    fn from(value: u32) -> Self {
        PinId(value)
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PinMode {
    Input,
    Output,
    InputPullUp,
    InputPullDown,
    Disabled,
}

impl PinMode {
    pub fn is_writable(&self) -> bool {
        matches!(self, PinMode::Output)
    }

    pub fn is_input(&self) -> bool {
        matches!(
            self,
            PinMode::Input | PinMode::InputPullUp | PinMode::InputPullDown
        )
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PinMode::Input => "input",
            PinMode::Output => "output",
            PinMode::InputPullUp => "input-pull-up",
            PinMode::InputPullDown => "input-pull-down",
            PinMode::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDirection {
    Rising,
    Falling,
}

impl EdgeDirection {
    /// Direction of a transition that ends at `level`.
    pub fn towards(level: bool) -> Self {
        if level {
            EdgeDirection::Rising
        } else {
            EdgeDirection::Falling
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeFilter {
    Rising,
    Falling,
    #[default]
    Both,
}

impl EdgeFilter {
    pub fn matches(&self, direction: EdgeDirection) -> bool {
        match self {
            EdgeFilter::Rising => direction == EdgeDirection::Rising,
            EdgeFilter::Falling => direction == EdgeDirection::Falling,
            EdgeFilter::Both => true,
        }
    }
}

/// A debounced transition. `timestamp` is measured on the registry clock and
/// marks the instant the new level first appeared; `sequence` increases by one
/// for every edge emitted on the pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EdgeEvent {
    pub pin: PinId,
    pub direction: EdgeDirection,
    pub timestamp: Duration,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PinState {
    pub level: bool,
    pub last_sample: Option<Duration>,
    pub last_transition: Option<Duration>,
}

/// A failure observed while sampling a pin in the background.
#[derive(Debug, Clone)]
pub struct PinFault {
    pub pin: PinId,
    pub error: GpioError,
    pub timestamp: Duration,
}

/// Monotonic time source shared by the sampler and backends.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RawSample {
    pub pin: PinId,
    pub claim: u64,
    pub level: bool,
    pub at: Duration,
}

pub(crate) enum SamplerMsg {
    Sample(RawSample),
    Fault {
        pin: PinId,
        claim: u64,
        error: GpioError,
    },
    Wake,
    Stop,
}

/// Producer end handed to backends that can report level changes
/// themselves. Pushing never blocks; a full queue drops the sample.
#[derive(Clone)]
pub struct RawSink {
    pin: PinId,
    claim: u64,
    clock: MonotonicClock,
    tx: SyncSender<SamplerMsg>,
    overruns: Arc<AtomicU64>,
}

impl RawSink {
    pub(crate) fn new(
        pin: PinId,
        claim: u64,
        clock: MonotonicClock,
        tx: SyncSender<SamplerMsg>,
        overruns: Arc<AtomicU64>,
    ) -> Self {
        Self {
            pin,
            claim,
            clock,
            tx,
            overruns,
        }
    }

    pub fn pin(&self) -> PinId {
        self.pin
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Report `level` as observed now. Returns false if the sample was lost.
    pub fn push(&self, level: bool) -> bool {
        self.push_at(level, self.clock.now())
    }

    pub fn push_at(&self, level: bool, at: Duration) -> bool {
        let sample = RawSample {
            pin: self.pin,
            claim: self.claim,
            level,
            at,
        };
        match self.tx.try_send(SamplerMsg::Sample(sample)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let lost = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("raw sample queue full, dropped sample for pin {} ({lost} total)", self.pin);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Report that the backend can no longer observe this pin. A
    /// `BackendFault` degrades the pin; other errors are surfaced to
    /// subscribers as transient faults.
    pub fn report(&self, error: GpioError) {
        let msg = SamplerMsg::Fault {
            pin: self.pin,
            claim: self.claim,
            error,
        };
        if let Err(TrySendError::Full(_)) = self.tx.try_send(msg) {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            warn!("raw sample queue full, dropped fault report for pin {}", self.pin);
        }
    }
}

/// Keeps an interrupt-driven raw subscription alive; dropping it stops the
/// backend from pushing further samples.
pub struct RawWatch {
    _guard: Box<dyn Send>,
}

impl RawWatch {
    pub fn new<G: Send + 'static>(guard: G) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

pub trait GpioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every pin this backend can drive.
    fn lines(&self) -> GpioResult<Vec<PinId>>;

    fn supports(&self, pin: PinId, mode: PinMode) -> bool;

    fn configure(&self, pin: PinId, mode: PinMode) -> GpioResult<()>;

    fn read_level(&self, pin: PinId) -> GpioResult<bool>;

    /// Fails with `WriteNotPermitted` unless the pin is configured as output.
    fn write_level(&self, pin: PinId, level: bool) -> GpioResult<()>;

    /// Start pushing level changes of `pin` into `sink`. `Ok(None)` means the
    /// backend has no change notification and the pin must be polled with
    /// `read_level`.
    fn subscribe_raw(&self, pin: PinId, sink: RawSink) -> GpioResult<Option<RawWatch>> {
        let _ = (pin, sink);
        Ok(None)
    }

    /// Return the line to an idle state once nobody owns it.
    fn release(&self, pin: PinId) -> GpioResult<()> {
        self.configure(pin, PinMode::Disabled)
    }
}
