pub mod daemon;
#[cfg(feature = "libgpiod")]
pub mod libgpiod;
pub mod mock;
pub mod register;

use std::sync::Arc;

pub use daemon::DaemonBackend;
#[cfg(feature = "libgpiod")]
pub use libgpiod::LibgpiodBackend;
pub use mock::{MockFailure, MockGpioBackend};
pub use register::RegisterBackend;

use crate::config::{BackendConfig, GpioConfig};
use crate::error::GpioResult;
use crate::gpio::GpioBackend;

/// Build the backend selected in `config`.
pub fn from_config(config: &GpioConfig) -> GpioResult<Arc<dyn GpioBackend>> {
    let backend: Arc<dyn GpioBackend> = match &config.backend {
        BackendConfig::Mock { polling, lines } => {
            let mock = match (polling, lines) {
                (false, None) => MockGpioBackend::default(),
                (false, Some(n)) => MockGpioBackend::new(*n),
                (true, n) => MockGpioBackend::polling(n.unwrap_or(mock::MOCK_DEFAULT_LINES)),
            };
            Arc::new(mock)
        }
        BackendConfig::Register { soc, device } => Arc::new(RegisterBackend::open(*soc, device)?),
        BackendConfig::Daemon { host, port } => Arc::new(DaemonBackend::connect(
            host,
            *port,
            config.backend_timeout(),
        )?),
        #[cfg(feature = "libgpiod")]
        BackendConfig::Libgpiod { chip } => Arc::new(LibgpiodBackend::open(chip)?),
        #[cfg(not(feature = "libgpiod"))]
        BackendConfig::Libgpiod { .. } => {
            return Err(crate::error::GpioError::Config(
                "libgpiod backend requires the `libgpiod` feature".into(),
            ));
        }
    };
    Ok(backend)
}
