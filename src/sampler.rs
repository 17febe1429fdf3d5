use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::debounce::{Debouncer, Transition};
use crate::dispatch::Dispatcher;
use crate::error::{GpioError, GpioResult};
use crate::gpio::{
    EdgeEvent, GpioBackend, MonotonicClock, PinFault, PinId, PinState, RawSample, RawSink,
    RawWatch, SamplerMsg,
};

// upper bound on how long the loop sleeps with nothing to do
const SAMPLER_IDLE_TICK: Duration = Duration::from_millis(50);

/// Pins whose backend reported inconsistent data.
#[derive(Default)]
pub(crate) struct DegradedPins {
    pins: Mutex<FxHashSet<PinId>>,
}

impl DegradedPins {
    pub fn mark(&self, pin: PinId) {
        if self.pins.lock().insert(pin) {
            warn!("pin {pin} marked degraded");
        }
    }

    pub fn clear(&self, pin: PinId) -> bool {
        self.pins.lock().remove(&pin)
    }

    pub fn contains(&self, pin: PinId) -> bool {
        self.pins.lock().contains(&pin)
    }
}

struct Watch {
    claim: u64,
    debouncer: Debouncer,
    raw: Option<RawWatch>,
    next_poll: Option<Duration>,
    failing: bool,
}

#[derive(Default)]
struct WatchTable {
    watches: FxHashMap<PinId, Watch>,
    // survives release so sequence numbers keep increasing per pin
    sequences: FxHashMap<PinId, u64>,
}

impl WatchTable {
    fn next_deadline(&self) -> Option<Duration> {
        self.watches
            .values()
            .flat_map(|w| [w.debouncer.deadline(), w.next_poll])
            .flatten()
            .min()
    }

    fn emit(&mut self, dispatcher: &Dispatcher, pin: PinId, t: Transition) {
        let counter = self.sequences.entry(pin).or_insert(0);
        let sequence = *counter;
        *counter += 1;
        dispatcher.dispatch(EdgeEvent {
            pin,
            direction: t.direction,
            timestamp: t.at,
            sequence,
        });
    }
}

struct SamplerShared {
    backend: Arc<dyn GpioBackend>,
    dispatcher: Arc<Dispatcher>,
    degraded: Arc<DegradedPins>,
    clock: MonotonicClock,
    poll_interval: Duration,
    table: Mutex<WatchTable>,
    running: AtomicBool,
}

impl SamplerShared {
    fn apply(&self, table: &mut WatchTable, sample: RawSample) {
        let Some(watch) = table.watches.get_mut(&sample.pin) else {
            return;
        };
        if watch.claim != sample.claim {
            return;
        }
        watch.failing = false;
        if let Some(t) = watch.debouncer.sample(sample.level, sample.at) {
            table.emit(&self.dispatcher, sample.pin, t);
        }
    }

    fn fail(&self, table: &mut WatchTable, pin: PinId, claim: u64, error: GpioError) {
        let Some(watch) = table.watches.get_mut(&pin) else {
            return;
        };
        if watch.claim != claim {
            return;
        }
        let persistent = matches!(error, GpioError::BackendFault { .. });
        if persistent {
            watch.next_poll = None;
            watch.raw = None;
            self.degraded.mark(pin);
        } else if watch.failing {
            // already reported, stay quiet until the pin recovers
            return;
        }
        watch.failing = true;
        warn!("sampling pin {pin} failed: {error}");
        self.dispatcher.report_fault(&PinFault {
            pin,
            error,
            timestamp: self.clock.now(),
        });
    }

    fn handle(&self, table: &mut WatchTable, msg: SamplerMsg) {
        match msg {
            SamplerMsg::Sample(sample) => self.apply(table, sample),
            SamplerMsg::Fault { pin, claim, error } => self.fail(table, pin, claim, error),
            SamplerMsg::Wake => {}
            SamplerMsg::Stop => self.running.store(false, Ordering::Release),
        }
    }

    fn poll_due(&self) {
        let now = self.clock.now();
        let due: Vec<(PinId, u64)> = {
            let mut table = self.table.lock();
            table
                .watches
                .iter_mut()
                .filter_map(|(pin, w)| match w.next_poll {
                    Some(at) if at <= now => {
                        w.next_poll = Some(now + self.poll_interval);
                        Some((*pin, w.claim))
                    }
                    _ => None,
                })
                .collect()
        };
        if due.is_empty() {
            return;
        }

        // backend reads happen without holding the table
        let results: Vec<_> = due
            .into_iter()
            .map(|(pin, claim)| (pin, claim, self.backend.read_level(pin), self.clock.now()))
            .collect();

        let mut table = self.table.lock();
        for (pin, claim, result, at) in results {
            match result {
                Ok(level) => self.apply(
                    &mut table,
                    RawSample {
                        pin,
                        claim,
                        level,
                        at,
                    },
                ),
                Err(e) => self.fail(&mut table, pin, claim, e),
            }
        }
    }

    fn settle(&self) {
        let now = self.clock.now();
        let mut table = self.table.lock();
        let matured: Vec<_> = table
            .watches
            .iter_mut()
            .filter_map(|(pin, w)| w.debouncer.poll(now).map(|t| (*pin, t)))
            .collect();
        for (pin, t) in matured {
            table.emit(&self.dispatcher, pin, t);
        }
    }

    fn wait_time(&self) -> Duration {
        let now = self.clock.now();
        match self.table.lock().next_deadline() {
            Some(at) => at.saturating_sub(now).min(SAMPLER_IDLE_TICK),
            None => SAMPLER_IDLE_TICK,
        }
    }

    fn run(&self, rx: Receiver<SamplerMsg>) {
        while self.running.load(Ordering::Acquire) {
            match rx.recv_timeout(self.wait_time()) {
                Ok(msg) => {
                    let mut table = self.table.lock();
                    self.handle(&mut table, msg);
                    while let Ok(msg) = rx.try_recv() {
                        self.handle(&mut table, msg);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.poll_due();
            self.settle();
        }
        debug!("sampler stopped");
    }
}

/// Owns the background thread that turns raw samples into edge events.
///
/// Debouncers are only touched while holding the watch table, and only the
/// sampler thread feeds them samples, so each pin has a single writer.
pub(crate) struct Sampler {
    shared: Arc<SamplerShared>,
    tx: SyncSender<SamplerMsg>,
    overruns: Arc<AtomicU64>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Sampler {
    pub fn start(
        backend: Arc<dyn GpioBackend>,
        dispatcher: Arc<Dispatcher>,
        degraded: Arc<DegradedPins>,
        clock: MonotonicClock,
        poll_interval: Duration,
        queue_capacity: usize,
    ) -> GpioResult<Self> {
        let (tx, rx) = mpsc::sync_channel(queue_capacity);
        let shared = Arc::new(SamplerShared {
            backend,
            dispatcher,
            degraded,
            clock,
            poll_interval,
            table: Mutex::new(WatchTable::default()),
            running: AtomicBool::new(true),
        });

        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name("pinctl-sampler".into())
            .spawn(move || worker.run(rx))
            .map_err(|e| GpioError::BackendUnavailable(format!("spawn sampler thread: {e}")))?;

        Ok(Self {
            shared,
            tx,
            overruns: Arc::new(AtomicU64::new(0)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Start debouncing `pin` for the given claim, through the backend's
    /// change notification when it has one and by polling otherwise.
    pub fn watch(&self, pin: PinId, claim: u64, window: Duration) -> GpioResult<()> {
        let debouncer = match self.shared.backend.read_level(pin) {
            Ok(level) => Debouncer::seeded(window, level, self.shared.clock.now()),
            Err(e @ GpioError::BackendFault { .. }) => return Err(e),
            Err(e) => {
                warn!("could not read initial level of pin {pin}: {e}");
                Debouncer::new(window)
            }
        };

        self.shared.table.lock().watches.insert(
            pin,
            Watch {
                claim,
                debouncer,
                raw: None,
                next_poll: None,
                failing: false,
            },
        );

        if let Err(e) = self.attach(pin, claim) {
            self.unwatch(pin, claim);
            return Err(e);
        }
        Ok(())
    }

    /// Start sampling a watch that a backend fault stopped. Does nothing if
    /// `pin` is not watched or is still being sampled.
    pub fn resume(&self, pin: PinId) -> GpioResult<()> {
        let claim = {
            let mut table = self.shared.table.lock();
            match table.watches.get_mut(&pin) {
                Some(w) if w.raw.is_none() && w.next_poll.is_none() => {
                    w.failing = false;
                    w.claim
                }
                _ => return Ok(()),
            }
        };
        self.attach(pin, claim)
    }

    /// Subscribe to the backend for the watch of `claim` and start feeding it.
    fn attach(&self, pin: PinId, claim: u64) -> GpioResult<()> {
        let sink = RawSink::new(
            pin,
            claim,
            self.shared.clock,
            self.tx.clone(),
            self.overruns.clone(),
        );
        let raw = self.shared.backend.subscribe_raw(pin, sink)?;

        let mode = if raw.is_some() { "notification" } else { "polling" };
        let leftover = {
            let mut table = self.shared.table.lock();
            match table.watches.get_mut(&pin) {
                Some(watch) if watch.claim == claim => {
                    match raw {
                        Some(raw) => watch.raw = Some(raw),
                        None => watch.next_poll = Some(self.shared.clock.now()),
                    }
                    None
                }
                // released while the backend was subscribing
                _ => raw,
            }
        };
        if leftover.is_some() {
            return Ok(());
        }
        debug!("watching pin {pin} by {mode}");

        let _ = self.tx.try_send(SamplerMsg::Wake);
        Ok(())
    }

    /// Stop accepting samples for the claim. Once this returns no further
    /// event for it reaches the dispatcher.
    pub fn unwatch(&self, pin: PinId, claim: u64) {
        let removed = {
            let mut table = self.shared.table.lock();
            match table.watches.get(&pin) {
                Some(w) if w.claim == claim => table.watches.remove(&pin),
                _ => None,
            }
        };
        if let Some(watch) = removed {
            // stops the backend listener outside the table lock
            drop(watch.raw);
            debug!("stopped watching pin {pin}");
        }
    }

    pub fn set_window(&self, pin: PinId, window: Duration) {
        if let Some(watch) = self.shared.table.lock().watches.get_mut(&pin) {
            watch.debouncer.set_window(window);
        }
        let _ = self.tx.try_send(SamplerMsg::Wake);
    }

    pub fn state(&self, pin: PinId) -> Option<PinState> {
        self.shared
            .table
            .lock()
            .watches
            .get(&pin)
            .and_then(|w| w.debouncer.state())
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let watches: Vec<Watch> = {
            let mut table = self.shared.table.lock();
            table.watches.drain().map(|(_, w)| w).collect()
        };
        drop(watches);

        self.shared.running.store(false, Ordering::Release);
        let _ = self.tx.try_send(SamplerMsg::Stop);
        if thread.join().is_err() {
            error!("sampler thread panicked");
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
