use std::{collections::HashSet, fs, path::Path, time::Duration};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;
use crate::gpio::{PinId, PinMode};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Soc {
    /// Pi 1 and Zero.
    Bcm2835,
    /// Pi 2 and 3; the BCM2835 register layout at a different base.
    Bcm2837,
    /// Pi 4.
    #[default]
    Bcm2711,
}

fn default_daemon_port() -> u16 {
    8888
}

fn default_register_device() -> String {
    "/dev/gpiomem".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendConfig {
    Mock {
        #[serde(default)]
        polling: bool,
        #[serde(default)]
        lines: Option<u32>,
    },
    Register {
        #[serde(default)]
        soc: Soc,
        #[serde(default = "default_register_device")]
        device: String,
    },
    Daemon {
        host: String,
        #[serde(default = "default_daemon_port")]
        port: u16,
    },
    Libgpiod {
        chip: String,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Mock {
            polling: false,
            lines: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct PinConfig {
    #[serde(default)]
    pub name: String,
    /// Modes the board wiring allows on this pin; empty means any mode the
    /// backend supports.
    #[serde(default)]
    pub capabilities: HashSet<PinMode>,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
}

impl PinConfig {
    pub fn allows(&self, mode: PinMode) -> bool {
        mode == PinMode::Disabled || self.capabilities.is_empty() || self.capabilities.contains(&mode)
    }
}

fn default_debounce_ms() -> u64 {
    20
}

fn default_poll_interval_ms() -> u64 {
    2
}

fn default_backend_timeout_ms() -> u64 {
    250
}

fn default_raw_queue_capacity() -> usize {
    1024
}

fn default_subscription_capacity() -> usize {
    64
}

fn default_fault_capacity() -> usize {
    16
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GpioConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    /// Pins exposed on the board. When empty every backend line is usable.
    #[serde(default)]
    pub pins: FxHashMap<u32, PinConfig>,
    #[serde(default = "default_debounce_ms")]
    pub default_debounce_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,
    #[serde(default = "default_raw_queue_capacity")]
    pub raw_queue_capacity: usize,
    #[serde(default = "default_subscription_capacity")]
    pub subscription_capacity: usize,
    #[serde(default = "default_fault_capacity")]
    pub fault_capacity: usize,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            pins: FxHashMap::default(),
            default_debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            backend_timeout_ms: default_backend_timeout_ms(),
            raw_queue_capacity: default_raw_queue_capacity(),
            subscription_capacity: default_subscription_capacity(),
            fault_capacity: default_fault_capacity(),
        }
    }
}

impl GpioConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, GpioError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GpioError> {
        if self.poll_interval_ms == 0 {
            return Err(GpioError::Config("poll_interval_ms must be positive".into()));
        }
        if self.backend_timeout_ms == 0 {
            return Err(GpioError::Config("backend_timeout_ms must be positive".into()));
        }
        if self.raw_queue_capacity == 0
            || self.subscription_capacity == 0
            || self.fault_capacity == 0
        {
            return Err(GpioError::Config("queue capacities must be positive".into()));
        }
        Ok(())
    }

    pub fn pin(&self, pin: PinId) -> Option<&PinConfig> {
        self.pins.get(&pin.as_u32())
    }

    pub fn debounce_for(&self, pin: PinId) -> Duration {
        let ms = self
            .pin(pin)
            .and_then(|p| p.debounce_ms)
            .unwrap_or(self.default_debounce_ms);
        Duration::from_millis(ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}
