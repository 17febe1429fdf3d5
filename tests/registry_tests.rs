use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use pinctl::{
    GpioBackend, GpioConfig, GpioError, GpioResult, MockFailure, MockGpioBackend, PinId, PinMode,
    PinRegistry, RawSink, RawWatch,
};

const LED: PinId = PinId(17);
const BUTTON: PinId = PinId(27);
const GENERAL: PinId = PinId(22);

fn sample_config() -> GpioConfig {
    GpioConfig::from_json(
        r#"
        {
            "backend": { "kind": "mock", "lines": 28 },
            "pins": {
                "17": {
                    "name": "LED 1",
                    "capabilities": ["output"]
                },
                "27": {
                    "name": "BUTTON 1",
                    "capabilities": ["input", "input-pull-up", "input-pull-down"],
                    "debounce_ms": 30
                },
                "22": {
                    "name": "General IO 1"
                }
            },
            "default_debounce_ms": 5
        }
        "#,
    )
    .expect("valid sample config")
}

fn registry() -> (PinRegistry, MockGpioBackend) {
    let mock = MockGpioBackend::new(28);
    let registry = PinRegistry::new(sample_config(), Arc::new(mock.clone())).expect("registry");
    (registry, mock)
}

#[test]
fn lists_configured_pins() {
    let (registry, _) = registry();
    assert_eq!(registry.available_pins(), vec![LED, GENERAL, BUTTON]);
    assert_eq!(registry.pin_info(BUTTON).unwrap().name, "BUTTON 1");
    assert_eq!(registry.debounce(BUTTON).unwrap(), Duration::from_millis(30));
    assert_eq!(registry.debounce(GENERAL).unwrap(), Duration::from_millis(5));
    assert_eq!(registry.backend_name(), "mock");
}

#[test]
fn empty_pin_table_exposes_every_backend_line() {
    let registry =
        PinRegistry::new(GpioConfig::default(), Arc::new(MockGpioBackend::new(4))).unwrap();
    assert_eq!(
        registry.available_pins(),
        vec![PinId(0), PinId(1), PinId(2), PinId(3)]
    );
}

#[test]
fn config_pin_outside_backend_is_rejected() {
    let result = PinRegistry::new(sample_config(), Arc::new(MockGpioBackend::new(20)));
    assert!(matches!(result, Err(GpioError::Config(_))));
}

#[test]
fn second_acquire_is_already_claimed() {
    let (registry, mock) = registry();
    let led = registry.acquire(LED, PinMode::Output).unwrap();
    assert_eq!(mock.mode(LED).unwrap(), PinMode::Output);

    let err = registry.acquire(LED, PinMode::Output).unwrap_err();
    assert!(matches!(err, GpioError::AlreadyClaimed(PinId(17))));
    assert!(err.is_transient());

    drop(led);
    assert!(!registry.is_claimed(LED));
    assert_eq!(mock.mode(LED).unwrap(), PinMode::Disabled);
    registry.acquire(LED, PinMode::Output).unwrap();
}

#[test]
fn unknown_pin_and_unsupported_mode() {
    let (registry, mock) = registry();
    assert!(matches!(
        registry.acquire(PinId(3), PinMode::Input),
        Err(GpioError::InvalidPin(PinId(3)))
    ));
    assert!(matches!(
        registry.acquire(LED, PinMode::Input),
        Err(GpioError::UnsupportedMode { pin: PinId(17), mode: PinMode::Input })
    ));

    mock.disallow(GENERAL, PinMode::InputPullDown);
    assert!(matches!(
        registry.acquire(GENERAL, PinMode::InputPullDown),
        Err(GpioError::UnsupportedMode { .. })
    ));
    assert!(!registry.is_claimed(GENERAL));
    registry.acquire(GENERAL, PinMode::InputPullUp).unwrap();
}

#[test]
fn release_is_idempotent() {
    let (registry, _) = registry();
    let led = registry.acquire(LED, PinMode::Output).unwrap();
    registry.release(&led);
    registry.release(&led);
    led.dispose();
    assert!(led.is_disposed());
    assert!(matches!(led.read(), Err(GpioError::Released(PinId(17)))));
    assert!(matches!(led.write(true), Err(GpioError::Released(_))));

    // a stale handle must not release the pin's next owner
    let again = registry.acquire(LED, PinMode::Output).unwrap();
    registry.release(&led);
    assert!(registry.is_claimed(LED));
    drop(again);
}

#[test]
fn output_reads_back_last_written_level() {
    let (registry, mock) = registry();
    let led = registry.acquire(LED, PinMode::Output).unwrap();
    assert!(!mock.level(LED).unwrap());
    assert!(!led.read().unwrap());

    led.write(true).unwrap();
    assert!(led.read().unwrap());
    assert!(mock.level(LED).unwrap());
    assert_eq!(mock.read_count(LED).unwrap(), 0);

    assert!(!led.toggle().unwrap());
    assert!(!mock.level(LED).unwrap());
    assert_eq!(mock.write_count(LED).unwrap(), 3);
}

#[test]
fn output_can_start_high() {
    let (registry, mock) = registry();
    let led = registry.acquire_output(LED, true).unwrap();
    assert!(led.read().unwrap());
    assert!(mock.level(LED).unwrap());
}

#[test]
fn failed_write_keeps_cached_level() {
    let (registry, mock) = registry();
    let led = registry.acquire(LED, PinMode::Output).unwrap();
    mock.set_failure(LED, Some(MockFailure::Unavailable)).unwrap();
    assert!(matches!(led.write(true), Err(GpioError::BackendUnavailable(_))));
    assert!(!led.read().unwrap());
    assert!(!registry.is_degraded(LED));
}

#[test]
fn input_refuses_writes() {
    let (registry, mock) = registry();
    mock.set_input_level(BUTTON, true).unwrap();
    let button = registry.acquire(BUTTON, PinMode::Input).unwrap();
    assert!(button.read().unwrap());

    let err = button.write(false).unwrap_err();
    assert!(matches!(
        err,
        GpioError::WriteNotPermitted { pin: PinId(27), mode: PinMode::Input }
    ));
    assert!(matches!(button.toggle(), Err(GpioError::WriteNotPermitted { .. })));
    assert!(mock.level(BUTTON).unwrap());
}

#[test]
fn input_state_is_seeded_from_the_line() {
    let (registry, mock) = registry();
    mock.set_input_level(GENERAL, true).unwrap();
    let input = registry.acquire(GENERAL, PinMode::Input).unwrap();
    let state = input.state().expect("input pins are debounced");
    assert!(state.level);
    assert_eq!(state.last_transition, None);
    assert_eq!(registry.pin_state(GENERAL), Some(state));
}

#[test]
fn pull_up_reads_high() {
    let (registry, _) = registry();
    let button = registry.acquire(BUTTON, PinMode::InputPullUp).unwrap();
    assert!(button.read().unwrap());
}

#[test]
fn faulty_pin_is_degraded_until_reset() {
    let (registry, mock) = registry();
    mock.set_failure(GENERAL, Some(MockFailure::Fault)).unwrap();

    let err = registry.acquire(GENERAL, PinMode::Input).unwrap_err();
    assert!(matches!(err, GpioError::BackendFault { pin: PinId(22), .. }));
    assert!(!err.is_transient());
    assert!(registry.is_degraded(GENERAL));
    assert!(!registry.is_claimed(GENERAL));

    mock.set_failure(GENERAL, None).unwrap();
    assert!(matches!(
        registry.acquire(GENERAL, PinMode::Input),
        Err(GpioError::BackendFault { .. })
    ));

    registry.reset(GENERAL).unwrap();
    assert!(!registry.is_degraded(GENERAL));
    registry.acquire(GENERAL, PinMode::Input).unwrap();
}

#[test]
fn fault_during_read_degrades_pin() {
    let (registry, mock) = registry();
    let input = registry.acquire(GENERAL, PinMode::Input).unwrap();
    mock.set_failure(GENERAL, Some(MockFailure::Fault)).unwrap();
    assert!(matches!(input.read(), Err(GpioError::BackendFault { .. })));
    assert!(registry.is_degraded(GENERAL));
}

#[test]
fn concurrent_acquire_has_one_winner() {
    let (registry, _) = registry();
    let registry = Arc::new(registry);
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                registry.acquire(GENERAL, PinMode::Input)
            })
        })
        .collect();
    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, GpioError::AlreadyClaimed(_)))
    );
}

#[test]
fn shutdown_releases_everything() {
    let (registry, mock) = registry();
    let led = registry.acquire(LED, PinMode::Output).unwrap();
    let button = registry.acquire(BUTTON, PinMode::Input).unwrap();
    assert!(mock.has_raw_subscriber(BUTTON).unwrap());

    registry.shutdown();
    registry.shutdown();

    assert!(!registry.is_claimed(LED));
    assert!(!mock.has_raw_subscriber(BUTTON).unwrap());
    assert_eq!(mock.mode(BUTTON).unwrap(), PinMode::Disabled);
    assert!(matches!(led.write(true), Err(GpioError::Released(_))));
    assert!(matches!(button.read(), Err(GpioError::Released(_))));
    assert!(matches!(
        registry.acquire(GENERAL, PinMode::Input),
        Err(GpioError::BackendUnavailable(_))
    ));
}

#[test]
fn debounce_can_be_changed_at_runtime() {
    let (registry, _) = registry();
    registry
        .set_debounce(BUTTON, Duration::from_millis(100))
        .unwrap();
    assert_eq!(registry.debounce(BUTTON).unwrap(), Duration::from_millis(100));
    assert!(matches!(
        registry.set_debounce(PinId(3), Duration::ZERO),
        Err(GpioError::InvalidPin(_))
    ));
}

/// Mock whose line configuration takes a while, to race acquire against
/// shutdown.
struct SlowConfigure {
    inner: MockGpioBackend,
    delay: Duration,
}

impl GpioBackend for SlowConfigure {
    fn name(&self) -> &'static str {
        "slow-mock"
    }

    fn lines(&self) -> GpioResult<Vec<PinId>> {
        self.inner.lines()
    }

    fn supports(&self, pin: PinId, mode: PinMode) -> bool {
        self.inner.supports(pin, mode)
    }

    fn configure(&self, pin: PinId, mode: PinMode) -> GpioResult<()> {
        if mode != PinMode::Disabled {
            thread::sleep(self.delay);
        }
        self.inner.configure(pin, mode)
    }

    fn read_level(&self, pin: PinId) -> GpioResult<bool> {
        self.inner.read_level(pin)
    }

    fn write_level(&self, pin: PinId, level: bool) -> GpioResult<()> {
        self.inner.write_level(pin, level)
    }

    fn subscribe_raw(&self, pin: PinId, sink: RawSink) -> GpioResult<Option<RawWatch>> {
        self.inner.subscribe_raw(pin, sink)
    }

    fn release(&self, pin: PinId) -> GpioResult<()> {
        self.inner.release(pin)
    }
}

#[test]
fn shutdown_during_acquire_leaves_no_live_claim() {
    let mock = MockGpioBackend::new(8);
    let slow = SlowConfigure {
        inner: mock.clone(),
        delay: Duration::from_millis(150),
    };
    let registry = PinRegistry::new(GpioConfig::default(), Arc::new(slow)).unwrap();
    let pin = PinId(4);

    let result = thread::scope(|s| {
        let acquiring = s.spawn(|| registry.acquire(pin, PinMode::Input));
        thread::sleep(Duration::from_millis(40));
        registry.shutdown();
        acquiring.join().unwrap()
    });

    assert!(matches!(result, Err(GpioError::BackendUnavailable(_))));
    assert!(!registry.is_claimed(pin));
    assert!(!mock.has_raw_subscriber(pin).unwrap());
    assert_eq!(mock.mode(pin).unwrap(), PinMode::Disabled);
}
