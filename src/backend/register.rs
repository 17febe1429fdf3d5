//! Memory-mapped access to the Broadcom GPIO register block.
//!
//! `/dev/gpiomem` exposes just the GPIO block and needs no privileges;
//! `/dev/mem` is mapped at the SoC's peripheral base instead.

use std::fs::OpenOptions;
use std::ptr;
use std::thread;
use std::time::Duration;

use log::debug;
use memmap::{MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::Soc;
use crate::error::{GpioError, GpioResult};
use crate::gpio::{GpioBackend, PinId, PinMode};

const BLOCK_SIZE: usize = 4096;

const GPFSEL0: usize = 0x00;
const GPSET0: usize = 0x1c;
const GPCLR0: usize = 0x28;
const GPLEV0: usize = 0x34;
const GPPUD: usize = 0x94;
const GPPUDCLK0: usize = 0x98;
const GPIO_PUP_PDN_CNTRL_REG0: usize = 0xe4;

const FSEL_INPUT: u32 = 0b000;
const FSEL_OUTPUT: u32 = 0b001;

// the BCM2835 pull sequence needs 150 cycles of setup and hold
const PULL_SETTLE: Duration = Duration::from_micros(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pull {
    Off,
    Up,
    Down,
}

impl Soc {
    fn gpio_count(&self) -> u32 {
        match self {
            Soc::Bcm2835 | Soc::Bcm2837 => 54,
            Soc::Bcm2711 => 58,
        }
    }

    fn gpio_base(&self) -> u64 {
        match self {
            Soc::Bcm2835 => 0x2020_0000,
            Soc::Bcm2837 => 0x3F20_0000,
            Soc::Bcm2711 => 0xFE20_0000,
        }
    }
}

struct Registers {
    map: MmapMut,
}

impl Registers {
    fn read(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.map.len() && offset % 4 == 0);
        // the map is page aligned and every offset is a word boundary
        unsafe { ptr::read_volatile(self.map.as_ptr().add(offset) as *const u32) }
    }

    fn write(&mut self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.map.len() && offset % 4 == 0);
        unsafe { ptr::write_volatile(self.map.as_mut_ptr().add(offset) as *mut u32, value) }
    }

    fn set_function(&mut self, pin: u32, function: u32) {
        let offset = GPFSEL0 + (pin / 10) as usize * 4;
        let shift = (pin % 10) * 3;
        let value = self.read(offset);
        self.write(offset, (value & !(0b111 << shift)) | (function << shift));
    }

    fn set_pull(&mut self, soc: Soc, pin: u32, pull: Pull) {
        match soc {
            Soc::Bcm2711 => {
                let offset = GPIO_PUP_PDN_CNTRL_REG0 + (pin / 16) as usize * 4;
                let shift = (pin % 16) * 2;
                let bits = match pull {
                    Pull::Off => 0b00,
                    Pull::Up => 0b01,
                    Pull::Down => 0b10,
                };
                let value = self.read(offset);
                self.write(offset, (value & !(0b11 << shift)) | (bits << shift));
            }
            Soc::Bcm2835 | Soc::Bcm2837 => {
                let clock = GPPUDCLK0 + (pin / 32) as usize * 4;
                let control = match pull {
                    Pull::Off => 0,
                    Pull::Down => 1,
                    Pull::Up => 2,
                };
                self.write(GPPUD, control);
                thread::sleep(PULL_SETTLE);
                self.write(clock, 1 << (pin % 32));
                thread::sleep(PULL_SETTLE);
                self.write(GPPUD, 0);
                self.write(clock, 0);
            }
        }
    }

    fn level(&self, pin: u32) -> bool {
        let offset = GPLEV0 + (pin / 32) as usize * 4;
        self.read(offset) & (1 << (pin % 32)) != 0
    }

    fn drive(&mut self, pin: u32, level: bool) {
        let base = if level { GPSET0 } else { GPCLR0 };
        self.write(base + (pin / 32) as usize * 4, 1 << (pin % 32));
    }
}

/// Drives pins by writing the SoC's GPIO registers directly. There is no
/// change notification, so input pins are polled.
pub struct RegisterBackend {
    soc: Soc,
    registers: Mutex<Registers>,
    modes: RwLock<FxHashMap<PinId, PinMode>>,
}

impl RegisterBackend {
    pub fn open(soc: Soc, device: &str) -> GpioResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|e| GpioError::BackendUnavailable(format!("open {device}: {e}")))?;

        let offset = if device.ends_with("gpiomem") {
            0
        } else {
            soc.gpio_base()
        };

        let map = unsafe { MmapOptions::new().offset(offset).len(BLOCK_SIZE).map_mut(&file) }
            .map_err(|e| GpioError::BackendUnavailable(format!("map {device}: {e}")))?;

        debug!("mapped GPIO registers from {device}");
        Ok(Self::from_map(soc, map))
    }

    /// Operate on an already mapped register block.
    pub fn from_map(soc: Soc, map: MmapMut) -> Self {
        Self {
            soc,
            registers: Mutex::new(Registers { map }),
            modes: RwLock::new(FxHashMap::default()),
        }
    }

    fn check_pin(&self, pin: PinId) -> GpioResult<u32> {
        let line = pin.as_u32();
        if line >= self.soc.gpio_count() {
            return Err(GpioError::InvalidPin(pin));
        }
        Ok(line)
    }

    fn mode(&self, pin: PinId) -> PinMode {
        self.modes
            .read()
            .get(&pin)
            .copied()
            .unwrap_or(PinMode::Disabled)
    }

    /// Raw register word, for inspection.
    pub fn register(&self, offset: usize) -> u32 {
        self.registers.lock().read(offset)
    }
}

impl GpioBackend for RegisterBackend {
    fn name(&self) -> &'static str {
        "register"
    }

    fn lines(&self) -> GpioResult<Vec<PinId>> {
        Ok((0..self.soc.gpio_count()).map(PinId).collect())
    }

    fn supports(&self, pin: PinId, _mode: PinMode) -> bool {
        pin.as_u32() < self.soc.gpio_count()
    }

    fn configure(&self, pin: PinId, mode: PinMode) -> GpioResult<()> {
        let line = self.check_pin(pin)?;
        let (function, pull) = match mode {
            PinMode::Output => (FSEL_OUTPUT, Pull::Off),
            PinMode::Input | PinMode::Disabled => (FSEL_INPUT, Pull::Off),
            PinMode::InputPullUp => (FSEL_INPUT, Pull::Up),
            PinMode::InputPullDown => (FSEL_INPUT, Pull::Down),
        };

        {
            let mut registers = self.registers.lock();
            registers.set_function(line, function);
            registers.set_pull(self.soc, line, pull);
        }
        self.modes.write().insert(pin, mode);
        Ok(())
    }

    fn read_level(&self, pin: PinId) -> GpioResult<bool> {
        let line = self.check_pin(pin)?;
        Ok(self.registers.lock().level(line))
    }

    fn write_level(&self, pin: PinId, level: bool) -> GpioResult<()> {
        let line = self.check_pin(pin)?;
        let mode = self.mode(pin);
        if !mode.is_writable() {
            return Err(GpioError::WriteNotPermitted { pin, mode });
        }
        self.registers.lock().drive(line, level);
        Ok(())
    }
}
