//! Client for the pigpio daemon socket interface.
//!
//! Every command is a 16 byte frame of four little-endian words
//! `cmd p1 p2 p3`; the daemon echoes the first three and puts a signed
//! result in the last. Level changes arrive on a second connection opened
//! with `NOIB`, as 12 byte reports.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::{GpioError, GpioResult};
use crate::gpio::{GpioBackend, PinId, PinMode, RawSink, RawWatch};

const CMD_MODES: u32 = 0;
const CMD_PUD: u32 = 2;
const CMD_READ: u32 = 3;
const CMD_WRITE: u32 = 4;
const CMD_NB: u32 = 19;
const CMD_NC: u32 = 21;
const CMD_NOIB: u32 = 99;

const PI_INPUT: u32 = 0;
const PI_OUTPUT: u32 = 1;
const PUD_OFF: u32 = 0;
const PUD_DOWN: u32 = 1;
const PUD_UP: u32 = 2;

const PI_BAD_GPIO: i32 = -3;

const DAEMON_GPIO_COUNT: u32 = 54;
// notification bits only cover the first bank
const DAEMON_NOTIFY_LINES: u32 = 32;

const FRAME_LEN: usize = 16;
const REPORT_LEN: usize = 12;
const LISTENER_READ_TIMEOUT: Duration = Duration::from_millis(50);

struct DaemonInner {
    addr: SocketAddr,
    timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
    modes: RwLock<FxHashMap<PinId, PinMode>>,
}

impl DaemonInner {
    fn open(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn unavailable(&self, e: io::Error) -> GpioError {
        GpioError::BackendUnavailable(format!("pigpiod at {}: {e}", self.addr))
    }

    /// Send one command and return the daemon's result word. A broken
    /// connection is dropped and reopened by the next command.
    fn command(&self, pin: PinId, cmd: u32, p1: u32, p2: u32) -> GpioResult<i32> {
        let mut conn = self.conn.lock();
        if conn.is_none() {
            *conn = Some(self.open().map_err(|e| self.unavailable(e))?);
            warn!("reconnected to pigpiod at {}", self.addr);
        }
        let Some(stream) = conn.as_mut() else {
            return Err(GpioError::BackendUnavailable("no daemon connection".into()));
        };

        let mut frame = [0u8; FRAME_LEN];
        LittleEndian::write_u32_into(&[cmd, p1, p2, 0], &mut frame);
        let exchanged = stream
            .write_all(&frame)
            .and_then(|_| stream.read_exact(&mut frame));
        if let Err(e) = exchanged {
            *conn = None;
            return Err(self.unavailable(e));
        }

        let echoed = LittleEndian::read_u32(&frame[0..4]);
        if echoed != cmd {
            *conn = None;
            return Err(GpioError::fault(
                pin,
                format!("daemon answered command {echoed} to command {cmd}"),
            ));
        }

        match LittleEndian::read_i32(&frame[12..16]) {
            PI_BAD_GPIO => Err(GpioError::InvalidPin(pin)),
            code if code < 0 => Err(GpioError::fault(pin, format!("pigpio error {code}"))),
            result => Ok(result),
        }
    }
}

/// Talks to a local or remote `pigpiod`.
#[derive(Clone)]
pub struct DaemonBackend {
    inner: Arc<DaemonInner>,
}

impl DaemonBackend {
    /// Connect to the daemon; fails with `BackendUnavailable` if it cannot
    /// be reached within `timeout`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> GpioResult<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| GpioError::BackendUnavailable(format!("resolve {host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| GpioError::BackendUnavailable(format!("no address for {host}")))?;

        let inner = DaemonInner {
            addr,
            timeout,
            conn: Mutex::new(None),
            modes: RwLock::new(FxHashMap::default()),
        };
        let stream = inner.open().map_err(|e| inner.unavailable(e))?;
        *inner.conn.lock() = Some(stream);

        info!("connected to pigpiod at {addr}");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn check_pin(pin: PinId) -> GpioResult<()> {
        if pin.as_u32() >= DAEMON_GPIO_COUNT {
            return Err(GpioError::InvalidPin(pin));
        }
        Ok(())
    }
}

impl GpioBackend for DaemonBackend {
    fn name(&self) -> &'static str {
        "daemon"
    }

    fn lines(&self) -> GpioResult<Vec<PinId>> {
        Ok((0..DAEMON_GPIO_COUNT).map(PinId).collect())
    }

    fn supports(&self, pin: PinId, _mode: PinMode) -> bool {
        pin.as_u32() < DAEMON_GPIO_COUNT
    }

    fn configure(&self, pin: PinId, mode: PinMode) -> GpioResult<()> {
        Self::check_pin(pin)?;
        let (direction, pull) = match mode {
            PinMode::Output => (PI_OUTPUT, PUD_OFF),
            PinMode::Input | PinMode::Disabled => (PI_INPUT, PUD_OFF),
            PinMode::InputPullUp => (PI_INPUT, PUD_UP),
            PinMode::InputPullDown => (PI_INPUT, PUD_DOWN),
        };
        self.inner.command(pin, CMD_MODES, pin.as_u32(), direction)?;
        if direction == PI_INPUT {
            self.inner.command(pin, CMD_PUD, pin.as_u32(), pull)?;
        }
        self.inner.modes.write().insert(pin, mode);
        Ok(())
    }

    fn read_level(&self, pin: PinId) -> GpioResult<bool> {
        Self::check_pin(pin)?;
        match self.inner.command(pin, CMD_READ, pin.as_u32(), 0)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(GpioError::fault(pin, format!("daemon read level {other}"))),
        }
    }

    fn write_level(&self, pin: PinId, level: bool) -> GpioResult<()> {
        Self::check_pin(pin)?;
        let mode = self
            .inner
            .modes
            .read()
            .get(&pin)
            .copied()
            .unwrap_or(PinMode::Disabled);
        if !mode.is_writable() {
            return Err(GpioError::WriteNotPermitted { pin, mode });
        }
        self.inner
            .command(pin, CMD_WRITE, pin.as_u32(), u32::from(level))?;
        Ok(())
    }

    fn subscribe_raw(&self, pin: PinId, sink: RawSink) -> GpioResult<Option<RawWatch>> {
        Self::check_pin(pin)?;
        if pin.as_u32() >= DAEMON_NOTIFY_LINES {
            return Ok(None);
        }
        let listener = NotifyListener::start(self.inner.clone(), pin, sink)?;
        Ok(Some(RawWatch::new(listener)))
    }
}

/// One notification connection and the thread reading it.
struct NotifyListener {
    inner: Arc<DaemonInner>,
    pin: PinId,
    handle: u32,
    stream: TcpStream,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NotifyListener {
    fn start(inner: Arc<DaemonInner>, pin: PinId, sink: RawSink) -> GpioResult<Self> {
        let mut stream = inner.open().map_err(|e| inner.unavailable(e))?;

        let mut frame = [0u8; FRAME_LEN];
        LittleEndian::write_u32_into(&[CMD_NOIB, 0, 0, 0], &mut frame);
        stream
            .write_all(&frame)
            .and_then(|_| stream.read_exact(&mut frame))
            .map_err(|e| inner.unavailable(e))?;
        let handle = LittleEndian::read_i32(&frame[12..16]);
        if LittleEndian::read_u32(&frame[0..4]) != CMD_NOIB || handle < 0 {
            return Err(GpioError::fault(pin, format!("notification open failed ({handle})")));
        }
        let handle = handle as u32;

        let (cancel, thread) = match Self::arm(&inner, pin, handle, &stream, sink) {
            Ok(armed) => armed,
            Err(e) => {
                close_handle(&inner, pin, handle);
                return Err(e);
            }
        };

        debug!("notifications for pin {pin} on handle {handle}");
        Ok(Self {
            inner,
            pin,
            handle,
            stream,
            cancel,
            thread: Some(thread),
        })
    }

    /// Select `pin` on the open handle and start reading its reports.
    fn arm(
        inner: &DaemonInner,
        pin: PinId,
        handle: u32,
        stream: &TcpStream,
        sink: RawSink,
    ) -> GpioResult<(Arc<AtomicBool>, JoinHandle<()>)> {
        inner.command(pin, CMD_NB, handle, 1 << pin.as_u32())?;

        stream
            .set_read_timeout(Some(LISTENER_READ_TIMEOUT))
            .map_err(|e| inner.unavailable(e))?;
        let reader = stream.try_clone().map_err(|e| inner.unavailable(e))?;

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let thread = thread::Builder::new()
            .name(format!("pinctl-notify-{pin}"))
            .spawn(move || listen(reader, pin, sink, cancel_flag))
            .map_err(|e| GpioError::fault(pin, format!("spawn notify listener: {e}")))?;
        Ok((cancel, thread))
    }
}

fn close_handle(inner: &DaemonInner, pin: PinId, handle: u32) {
    if let Err(e) = inner.command(pin, CMD_NC, handle, 0) {
        warn!("closing notification handle {handle} for pin {pin}: {e}");
    }
}

fn listen(mut stream: TcpStream, pin: PinId, sink: RawSink, cancel: Arc<AtomicBool>) {
    let mut pending: Vec<u8> = Vec::with_capacity(REPORT_LEN * 8);
    let mut chunk = [0u8; REPORT_LEN * 16];

    while !cancel.load(Ordering::Relaxed) {
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                if !cancel.load(Ordering::Relaxed) {
                    sink.report(GpioError::fault(pin, "daemon closed the notification stream"));
                }
                return;
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if !cancel.load(Ordering::Relaxed) {
                    sink.report(GpioError::fault(pin, format!("notification stream: {e}")));
                }
                return;
            }
        };
        pending.extend_from_slice(&chunk[..n]);

        let complete = pending.len() - pending.len() % REPORT_LEN;
        for report in pending[..complete].chunks_exact(REPORT_LEN) {
            // watchdog, keep-alive and event reports carry flags
            if LittleEndian::read_u16(&report[2..4]) != 0 {
                continue;
            }
            let levels = LittleEndian::read_u32(&report[8..12]);
            sink.push(levels & (1 << pin.as_u32()) != 0);
        }
        pending.drain(..complete);
    }
}

impl Drop for NotifyListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        close_handle(&self.inner, self.pin, self.handle);
    }
}
