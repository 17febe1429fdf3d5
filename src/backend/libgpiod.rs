use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use log::{debug, warn};
use parking_lot::{FairMutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::{GpioError, GpioResult};
use crate::gpio::{GpioBackend, PinId, PinMode, RawSink, RawWatch};

const LIBGPIOD_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_EVENT_WAIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Character-device backend; each claimed pin holds its own line request.
pub struct LibgpiodBackend {
    chip: String,
    lines: u32,
    pins: RwLock<FxHashMap<PinId, LineHandle>>, // keyed by line offset
}

struct LineHandle {
    mode: PinMode,
    request: Arc<FairMutex<request::Request>>,
}

fn unavailable(what: &str, e: impl std::fmt::Display) -> GpioError {
    GpioError::BackendUnavailable(format!("{what}: {e}"))
}

impl LibgpiodBackend {
    pub fn open(chip: &str) -> GpioResult<Self> {
        let lines = Self::open_chip(chip)?
            .info()
            .map_err(|e| unavailable("chip info", e))?
            .num_lines() as u32;
        debug!("opened {chip} with {lines} line(s)");
        Ok(Self {
            chip: chip.to_string(),
            lines,
            pins: RwLock::new(FxHashMap::default()),
        })
    }

    fn open_chip(path: &str) -> GpioResult<Chip> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| unavailable(&format!("open chip {path}"), e))
    }

    fn request_line(&self, line_cfg: &line::Config) -> GpioResult<request::Request> {
        let chip = Self::open_chip(&self.chip)?;
        let mut req_cfg = request::Config::new().map_err(|e| unavailable("request config", e))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| unavailable("request consumer", e))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| unavailable("request lines", e))
    }

    fn make_line_settings(pin: PinId, mode: PinMode) -> GpioResult<line::Settings> {
        let fault = |what: &str, e: libgpiod::Error| GpioError::fault(pin, format!("{what}: {e}"));
        let mut ls = line::Settings::new().map_err(|e| fault("line settings", e))?;

        let (direction, bias) = match mode {
            PinMode::Output => (line::Direction::Output, None),
            PinMode::Input | PinMode::Disabled => (line::Direction::Input, None),
            PinMode::InputPullUp => (line::Direction::Input, Some(line::Bias::PullUp)),
            PinMode::InputPullDown => (line::Direction::Input, Some(line::Bias::PullDown)),
        };
        ls.set_direction(direction)
            .map_err(|e| fault("set direction", e))?;
        if !mode.is_writable() {
            ls.set_bias(bias).map_err(|e| fault("set bias", e))?;
        }

        if mode.is_input() {
            // raw edges feed the software debouncer; no kernel debounce
            ls.set_edge_detection(Some(line::Edge::Both))
                .map_err(|e| fault("set edge detection", e))?;
            ls.set_event_clock(EventClock::Monotonic)
                .map_err(|e| fault("set event clock", e))?;
        }

        Ok(ls)
    }

    fn make_line_config(pin: PinId, settings: line::Settings) -> GpioResult<line::Config> {
        let mut cfg =
            line::Config::new().map_err(|e| GpioError::fault(pin, format!("line config: {e}")))?;
        cfg.add_line_settings(&[pin.as_u32()], settings)
            .map_err(|e| GpioError::fault(pin, format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn check_pin(&self, pin: PinId) -> GpioResult<()> {
        if pin.as_u32() >= self.lines {
            return Err(GpioError::InvalidPin(pin));
        }
        Ok(())
    }

    fn request_for(&self, pin: PinId) -> GpioResult<(PinMode, Arc<FairMutex<request::Request>>)> {
        self.check_pin(pin)?;
        let pins = self.pins.read();
        let handle = pins.get(&pin).ok_or(GpioError::UnsupportedMode {
            pin,
            mode: PinMode::Disabled,
        })?;
        Ok((handle.mode, handle.request.clone()))
    }
}

impl GpioBackend for LibgpiodBackend {
    fn name(&self) -> &'static str {
        "libgpiod"
    }

    fn lines(&self) -> GpioResult<Vec<PinId>> {
        Ok((0..self.lines).map(PinId).collect())
    }

    fn supports(&self, pin: PinId, _mode: PinMode) -> bool {
        pin.as_u32() < self.lines
    }

    fn configure(&self, pin: PinId, mode: PinMode) -> GpioResult<()> {
        self.check_pin(pin)?;
        let mut pins = self.pins.write();

        // dropping the request hands the line back to the kernel
        if mode == PinMode::Disabled {
            pins.remove(&pin);
            return Ok(());
        }

        let line_cfg = Self::make_line_config(pin, Self::make_line_settings(pin, mode)?)?;
        match pins.get_mut(&pin) {
            Some(handle) => {
                handle
                    .request
                    .lock()
                    .reconfigure_lines(&line_cfg)
                    .map_err(|e| GpioError::fault(pin, format!("reconfigure lines: {e}")))?;
                handle.mode = mode;
            }
            None => {
                let request = self.request_line(&line_cfg)?;
                pins.insert(
                    pin,
                    LineHandle {
                        mode,
                        request: Arc::new(FairMutex::new(request)),
                    },
                );
            }
        }
        Ok(())
    }

    fn read_level(&self, pin: PinId) -> GpioResult<bool> {
        let (_, request) = self.request_for(pin)?;
        let value = request
            .lock()
            .value(pin.as_u32())
            .map_err(|e| GpioError::fault(pin, format!("get value: {e}")))?;
        Ok(matches!(value, line::Value::Active))
    }

    fn write_level(&self, pin: PinId, level: bool) -> GpioResult<()> {
        let (mode, request) = self.request_for(pin)?;
        if !mode.is_writable() {
            return Err(GpioError::WriteNotPermitted { pin, mode });
        }
        let value = if level {
            line::Value::Active
        } else {
            line::Value::InActive
        };
        request
            .lock()
            .set_value(pin.as_u32(), value)
            .map_err(|e| GpioError::fault(pin, format!("set value: {e}")))?;
        Ok(())
    }

    fn subscribe_raw(&self, pin: PinId, sink: RawSink) -> GpioResult<Option<RawWatch>> {
        let (mode, request) = self.request_for(pin)?;
        if !mode.is_input() {
            return Ok(None);
        }
        Ok(Some(RawWatch::new(EdgeListener::new(pin, request, sink)?)))
    }
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        pin: PinId,
        request: Arc<FairMutex<request::Request>>,
        sink: RawSink,
    ) -> GpioResult<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_EVENT_BUFFER_CAPACITY)
            .map_err(|e| GpioError::fault(pin, format!("event buffer: {e}")))?;

        let handle = std::thread::Builder::new()
            .name(format!("pinctl-edges-{pin}"))
            .spawn(move || {
                while !cancel_flag.load(Ordering::Relaxed) {
                    let req = request.lock();

                    let has_event = match req.wait_edge_events(Some(LIBGPIOD_EVENT_WAIT_TIMEOUT)) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("wait edge events error for pin {pin}: {e}");
                            yield_now();
                            continue;
                        }
                    };
                    if !has_event {
                        continue;
                    }

                    let events = match req.read_edge_events(&mut buffer) {
                        Ok(evts) => evts,
                        Err(e) => {
                            warn!("read edge events error for pin {pin}: {e}");
                            yield_now();
                            continue;
                        }
                    };
                    for evt in events {
                        let Ok(evt) = evt else {
                            continue;
                        };
                        match evt.event_type() {
                            Ok(line::EdgeKind::Rising) => sink.push(true),
                            Ok(line::EdgeKind::Falling) => sink.push(false),
                            Err(_) => continue,
                        };
                    }
                }
            })
            .map_err(|e| GpioError::fault(pin, format!("spawn edge listener: {e}")))?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
