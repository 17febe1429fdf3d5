pub mod backend;
mod config;
mod debounce;
mod dispatch;
mod error;
mod gpio;
mod handle;
mod registry;
mod sampler;

pub use config::{BackendConfig, GpioConfig, PinConfig, Soc};
pub use debounce::{Debouncer, Transition};
pub use dispatch::{Dispatcher, Notification, Subscription, SubscriptionId};
pub use error::{GpioError, GpioResult};
pub use gpio::{
    EdgeDirection, EdgeEvent, EdgeFilter, GpioBackend, MonotonicClock, PinFault, PinId, PinMode,
    PinState, RawSink, RawWatch,
};
pub use handle::PinHandle;
pub use registry::PinRegistry;

#[cfg(feature = "libgpiod")]
pub use backend::LibgpiodBackend;
pub use backend::{DaemonBackend, MockFailure, MockGpioBackend, RegisterBackend};
