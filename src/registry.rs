use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::backend;
use crate::config::{GpioConfig, PinConfig};
use crate::dispatch::{Dispatcher, Notification, Subscription};
use crate::error::{GpioError, GpioResult};
use crate::gpio::{EdgeFilter, GpioBackend, MonotonicClock, PinId, PinMode, PinState};
use crate::handle::PinHandle;
use crate::sampler::{DegradedPins, Sampler};

#[derive(Default)]
struct ClaimTable {
    claims: FxHashMap<PinId, u64>,
    next_claim: u64,
}

pub(crate) struct RegistryShared {
    pub(crate) backend: Arc<dyn GpioBackend>,
    board: FxHashMap<PinId, PinConfig>,
    claims: Mutex<ClaimTable>,
    pub(crate) degraded: Arc<DegradedPins>,
    debounce: RwLock<FxHashMap<PinId, Duration>>,
    default_debounce: Duration,
    sampler: Sampler,
    dispatcher: Arc<Dispatcher>,
    clock: MonotonicClock,
    shut_down: AtomicBool,
}

impl RegistryShared {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn note_error(&self, error: &GpioError) {
        if let GpioError::BackendFault { pin, .. } = error {
            self.degraded.mark(*pin);
        }
    }

    pub(crate) fn pin_state(&self, pin: PinId) -> Option<PinState> {
        self.sampler.state(pin)
    }

    /// Drop the claim if it is still the current one for `pin`.
    pub(crate) fn release_claim(&self, pin: PinId, claim: u64) {
        let mut claims = self.claims.lock();
        if claims.claims.get(&pin) != Some(&claim) {
            return;
        }
        self.sampler.unwatch(pin, claim);
        if let Err(e) = self.backend.release(pin) {
            warn!("releasing pin {pin} on {}: {e}", self.backend.name());
        }
        claims.claims.remove(&pin);
        debug!("pin {pin} released (claim {claim})");
    }

    fn debounce_for(&self, pin: PinId) -> Duration {
        self.debounce
            .read()
            .get(&pin)
            .copied()
            .unwrap_or(self.default_debounce)
    }
}

/// Owns every pin of the board.
///
/// Pins are handed out as [`PinHandle`]s, at most one per pin. Input pins are
/// debounced in the background and their edges published through the
/// registry's [`Dispatcher`].
pub struct PinRegistry {
    shared: Arc<RegistryShared>,
}

impl PinRegistry {
    pub fn from_config(config: GpioConfig) -> GpioResult<Self> {
        let backend = backend::from_config(&config)?;
        Self::new(config, backend)
    }

    pub fn new(config: GpioConfig, backend: Arc<dyn GpioBackend>) -> GpioResult<Self> {
        config.validate()?;

        let lines = backend.lines()?;
        let board: FxHashMap<PinId, PinConfig> = if config.pins.is_empty() {
            lines.iter().map(|pin| (*pin, PinConfig::default())).collect()
        } else {
            let mut board = FxHashMap::default();
            for (id, pin_cfg) in &config.pins {
                let pin = PinId(*id);
                if !lines.contains(&pin) {
                    return Err(GpioError::Config(format!(
                        "pin {pin} is not provided by backend {}",
                        backend.name()
                    )));
                }
                board.insert(pin, pin_cfg.clone());
            }
            board
        };

        let debounce = board
            .keys()
            .map(|pin| (*pin, config.debounce_for(*pin)))
            .collect();

        let clock = MonotonicClock::new();
        let dispatcher = Dispatcher::new(config.subscription_capacity, config.fault_capacity);
        let degraded = Arc::new(DegradedPins::default());
        let sampler = Sampler::start(
            backend.clone(),
            dispatcher.clone(),
            degraded.clone(),
            clock,
            config.poll_interval(),
            config.raw_queue_capacity,
        )?;

        info!(
            "pin registry ready on backend {} with {} pin(s)",
            backend.name(),
            board.len()
        );

        Ok(Self {
            shared: Arc::new(RegistryShared {
                backend,
                board,
                claims: Mutex::new(ClaimTable::default()),
                degraded,
                debounce: RwLock::new(debounce),
                default_debounce: Duration::from_millis(config.default_debounce_ms),
                sampler,
                dispatcher,
                clock,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    fn pin_config(&self, pin: PinId) -> GpioResult<&PinConfig> {
        self.shared
            .board
            .get(&pin)
            .ok_or(GpioError::InvalidPin(pin))
    }

    /// Claim `pin` in `mode`. Output pins start driven low.
    pub fn acquire(&self, pin: PinId, mode: PinMode) -> GpioResult<PinHandle> {
        self.claim(pin, mode, false)
    }

    pub fn acquire_output(&self, pin: PinId, initial: bool) -> GpioResult<PinHandle> {
        self.claim(pin, PinMode::Output, initial)
    }

    fn claim(&self, pin: PinId, mode: PinMode, initial: bool) -> GpioResult<PinHandle> {
        let shared = &self.shared;
        if shared.is_shut_down() {
            return Err(GpioError::BackendUnavailable("registry is shut down".into()));
        }

        let cfg = self.pin_config(pin)?;
        if !cfg.allows(mode) || !shared.backend.supports(pin, mode) {
            return Err(GpioError::UnsupportedMode { pin, mode });
        }

        let claim = {
            let mut claims = shared.claims.lock();
            if shared.is_shut_down() {
                return Err(GpioError::BackendUnavailable("registry is shut down".into()));
            }
            if claims.claims.contains_key(&pin) {
                return Err(GpioError::AlreadyClaimed(pin));
            }
            if shared.degraded.contains(pin) {
                return Err(GpioError::fault(pin, "pin is degraded, reset it first"));
            }
            claims.next_claim += 1;
            let claim = claims.next_claim;
            claims.claims.insert(pin, claim);
            claim
        };

        if let Err(e) = self.bring_up(pin, mode, claim, initial) {
            shared.note_error(&e);
            shared.release_claim(pin, claim);
            return Err(e);
        }
        self.confirm(pin, claim)?;

        debug!("pin {pin} claimed as {mode} (claim {claim})");
        Ok(PinHandle::new(shared.clone(), pin, mode, claim, initial))
    }

    fn bring_up(&self, pin: PinId, mode: PinMode, claim: u64, initial: bool) -> GpioResult<()> {
        let shared = &self.shared;
        shared.backend.configure(pin, mode)?;
        if mode.is_writable() {
            shared.backend.write_level(pin, initial)?;
        }
        if mode.is_input() {
            shared.sampler.watch(pin, claim, shared.debounce_for(pin))?;
        }
        Ok(())
    }

    /// A shutdown can run while the backend is configuring the pin. Undo the
    /// bring-up if the claim did not survive it.
    fn confirm(&self, pin: PinId, claim: u64) -> GpioResult<()> {
        let shared = &self.shared;
        let mut claims = shared.claims.lock();
        let current = claims.claims.get(&pin) == Some(&claim);
        if current && !shared.is_shut_down() {
            return Ok(());
        }

        shared.sampler.unwatch(pin, claim);
        if current {
            claims.claims.remove(&pin);
        }
        if !claims.claims.contains_key(&pin) {
            if let Err(e) = shared.backend.release(pin) {
                warn!("releasing pin {pin} on {}: {e}", shared.backend.name());
            }
        }
        debug!("claim {claim} on pin {pin} dropped by shutdown");
        Err(GpioError::BackendUnavailable(
            "registry shut down during acquire".into(),
        ))
    }

    /// Idempotent; releasing an already released handle does nothing.
    pub fn release(&self, handle: &PinHandle) {
        handle.dispose();
    }

    pub fn is_claimed(&self, pin: PinId) -> bool {
        self.shared.claims.lock().claims.contains_key(&pin)
    }

    pub fn is_degraded(&self, pin: PinId) -> bool {
        self.shared.degraded.contains(pin)
    }

    /// Make a degraded pin available for acquisition again. A claimed input
    /// whose sampling was stopped by the fault is sampled again.
    pub fn reset(&self, pin: PinId) -> GpioResult<()> {
        self.pin_config(pin)?;
        if self.shared.degraded.clear(pin) {
            info!("pin {pin} reset");
        }
        if !self.is_claimed(pin) {
            return Ok(());
        }
        self.shared.sampler.resume(pin).inspect_err(|e| {
            self.shared.note_error(e);
        })
    }

    pub fn available_pins(&self) -> Vec<PinId> {
        let mut pins: Vec<_> = self.shared.board.keys().copied().collect();
        pins.sort();
        pins
    }

    pub fn pin_info(&self, pin: PinId) -> GpioResult<PinConfig> {
        self.pin_config(pin).cloned()
    }

    pub fn debounce(&self, pin: PinId) -> GpioResult<Duration> {
        self.pin_config(pin)?;
        Ok(self.shared.debounce_for(pin))
    }

    /// Change the quiet period for `pin`; applies to a live watch at once.
    pub fn set_debounce(&self, pin: PinId, window: Duration) -> GpioResult<()> {
        self.pin_config(pin)?;
        self.shared.debounce.write().insert(pin, window);
        self.shared.sampler.set_window(pin, window);
        Ok(())
    }

    /// Debounced state of a watched input pin.
    pub fn pin_state(&self, pin: PinId) -> Option<PinState> {
        self.shared.pin_state(pin)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.shared.dispatcher
    }

    fn check_pins(&self, pins: &[PinId]) -> GpioResult<()> {
        pins.iter().try_for_each(|pin| self.pin_config(*pin).map(|_| ()))
    }

    pub fn subscribe(&self, pins: &[PinId], filter: EdgeFilter) -> GpioResult<Subscription> {
        self.check_pins(pins)?;
        Ok(self.shared.dispatcher.subscribe(pins.iter().copied(), filter))
    }

    pub fn subscribe_with<F>(
        &self,
        pins: &[PinId],
        filter: EdgeFilter,
        consumer: F,
    ) -> GpioResult<Subscription>
    where
        F: FnMut(Notification) + Send + 'static,
    {
        self.check_pins(pins)?;
        self.shared
            .dispatcher
            .subscribe_with(pins.iter().copied(), filter, consumer)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.shared.dispatcher.unsubscribe(subscription);
    }

    /// Current time on the clock edge timestamps are measured against.
    pub fn now(&self) -> Duration {
        self.shared.clock.now()
    }

    /// Raw samples lost because the sampler queue was full.
    pub fn raw_overruns(&self) -> u64 {
        self.shared.sampler.overruns()
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.backend.name()
    }

    /// Release every claim and stop sampling. Outstanding handles keep
    /// existing but fail with `Released`.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let claims: Vec<(PinId, u64)> = {
            let claims = shared.claims.lock();
            claims.claims.iter().map(|(p, c)| (*p, *c)).collect()
        };
        for (pin, claim) in claims {
            shared.release_claim(pin, claim);
        }
        shared.sampler.shutdown();
        shared.dispatcher.close_all();
        info!("pin registry shut down");
    }
}

impl Drop for PinRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
