use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pinctl::{
    EdgeDirection, EdgeEvent, EdgeFilter, GpioConfig, GpioError, MockFailure, MockGpioBackend,
    Notification, PinId, PinMode, PinRegistry, Subscription,
};

const BUTTON: PinId = PinId(4);
const SENSOR: PinId = PinId(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(debounce_ms: u64, subscription_capacity: usize) -> GpioConfig {
    GpioConfig::from_json(&format!(
        r#"{{
            "default_debounce_ms": {debounce_ms},
            "subscription_capacity": {subscription_capacity},
            "poll_interval_ms": 1
        }}"#
    ))
    .expect("valid config")
}

fn registry_with(mock: &MockGpioBackend, debounce_ms: u64, capacity: usize) -> PinRegistry {
    init_logging();
    PinRegistry::new(config(debounce_ms, capacity), Arc::new(mock.clone())).expect("registry")
}

async fn next_edge(sub: &Subscription, within: Duration) -> Option<EdgeEvent> {
    tokio::time::timeout(within, sub.next_edge())
        .await
        .ok()
        .flatten()
}

fn drain_edges(sub: &Subscription) -> Vec<EdgeEvent> {
    let mut edges = Vec::new();
    while let Some(notification) = sub.try_recv() {
        if let Notification::Edge(edge) = notification {
            edges.push(edge);
        }
    }
    edges
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[tokio::test]
async fn bounces_collapse_into_one_rising_edge() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 50, 16);
    let _button = registry.acquire(BUTTON, PinMode::Input).unwrap();
    let sub = registry.subscribe(&[BUTTON], EdgeFilter::Both).unwrap();

    let before = registry.now();
    for level in [true, false, true, false, true] {
        mock.set_input_level(BUTTON, level).unwrap();
        thread::sleep(Duration::from_millis(3));
    }

    let edge = next_edge(&sub, Duration::from_secs(2))
        .await
        .expect("settled edge");
    assert_eq!(edge.pin, BUTTON);
    assert_eq!(edge.direction, EdgeDirection::Rising);
    assert_eq!(edge.sequence, 0);
    assert!(edge.timestamp >= before);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(sub.try_recv().is_none());

    let state = registry.pin_state(BUTTON).unwrap();
    assert!(state.level);
    assert_eq!(state.last_transition, Some(edge.timestamp));
}

#[tokio::test]
async fn glitch_shorter_than_window_is_ignored() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 40, 16);
    let _button = registry.acquire(BUTTON, PinMode::Input).unwrap();
    let sub = registry.subscribe(&[BUTTON], EdgeFilter::Both).unwrap();

    mock.set_input_level(BUTTON, true).unwrap();
    mock.set_input_level(BUTTON, false).unwrap();

    assert_eq!(next_edge(&sub, Duration::from_millis(150)).await, None);
    assert!(!registry.pin_state(BUTTON).unwrap().level);
}

#[tokio::test]
async fn subscribers_see_the_same_order() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 0, 64);
    let _button = registry.acquire(BUTTON, PinMode::Input).unwrap();
    let _sensor = registry.acquire(SENSOR, PinMode::Input).unwrap();
    let first = registry.subscribe(&[BUTTON, SENSOR], EdgeFilter::Both).unwrap();
    let second = registry.subscribe(&[BUTTON, SENSOR], EdgeFilter::Both).unwrap();
    let rising = registry.subscribe(&[BUTTON], EdgeFilter::Rising).unwrap();

    for i in 0..10 {
        let pin = if i % 3 == 0 { SENSOR } else { BUTTON };
        let level = !mock.level(pin).unwrap();
        mock.set_input_level(pin, level).unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    let mut a = Vec::new();
    assert!(wait_until(Duration::from_secs(2), || {
        a.extend(drain_edges(&first));
        a.len() == 10
    }));
    let mut b = Vec::new();
    assert!(wait_until(Duration::from_secs(2), || {
        b.extend(drain_edges(&second));
        b.len() == 10
    }));
    assert_eq!(a, b);

    let button: Vec<u64> = a.iter().filter(|e| e.pin == BUTTON).map(|e| e.sequence).collect();
    assert_eq!(button, (0..button.len() as u64).collect::<Vec<_>>());

    let rising = drain_edges(&rising);
    assert!(!rising.is_empty());
    assert!(rising.iter().all(|e| e.direction == EdgeDirection::Rising && e.pin == BUTTON));
}

#[test]
fn slow_subscriber_drops_oldest_without_blocking_others() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 0, 8);
    let _button = registry.acquire(BUTTON, PinMode::Input).unwrap();

    let slow = registry.subscribe(&[BUTTON], EdgeFilter::Both).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _fast = registry
        .subscribe_with(&[BUTTON], EdgeFilter::Both, move |n| {
            if let Notification::Edge(edge) = n {
                sink.lock().unwrap().push(edge.sequence);
            }
        })
        .unwrap();

    for i in 0..40 {
        mock.set_input_level(BUTTON, i % 2 == 0).unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 40));
    assert_eq!(*seen.lock().unwrap(), (0..40).collect::<Vec<u64>>());

    assert!(wait_until(Duration::from_secs(2), || slow.dropped() == 32));
    let kept: Vec<u64> = drain_edges(&slow).iter().map(|e| e.sequence).collect();
    assert_eq!(kept, (32..40).collect::<Vec<u64>>());
}

#[tokio::test]
async fn polling_backend_produces_edges() {
    let mock = MockGpioBackend::polling(8);
    let registry = registry_with(&mock, 10, 16);
    let _sensor = registry.acquire(SENSOR, PinMode::InputPullDown).unwrap();
    assert!(!mock.has_raw_subscriber(SENSOR).unwrap());
    let sub = registry.subscribe(&[SENSOR], EdgeFilter::Both).unwrap();

    mock.set_input_level(SENSOR, true).unwrap();
    let edge = next_edge(&sub, Duration::from_secs(2)).await.expect("rising");
    assert_eq!(edge.direction, EdgeDirection::Rising);

    mock.set_input_level(SENSOR, false).unwrap();
    let edge = next_edge(&sub, Duration::from_secs(2)).await.expect("falling");
    assert_eq!(edge.direction, EdgeDirection::Falling);
    assert_eq!(edge.sequence, 1);
    assert!(mock.read_count(SENSOR).unwrap() > 2);
}

#[tokio::test]
async fn backend_fault_reaches_fault_channel() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 0, 16);
    let _button = registry.acquire(BUTTON, PinMode::Input).unwrap();
    let sub = registry.subscribe(&[BUTTON], EdgeFilter::Both).unwrap();

    mock.set_failure(BUTTON, Some(MockFailure::Fault)).unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("fault in time")
        .expect("subscription open");
    let Notification::Fault(fault) = notification else {
        panic!("expected a fault, got {notification:?}");
    };
    assert_eq!(fault.pin, BUTTON);
    assert!(matches!(fault.error, GpioError::BackendFault { .. }));
    assert!(registry.is_degraded(BUTTON));
    assert!(!mock.has_raw_subscriber(BUTTON).unwrap());
}

#[tokio::test]
async fn reset_restarts_sampling_of_a_claimed_pin() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 0, 16);
    let _button = registry.acquire(BUTTON, PinMode::Input).unwrap();
    let sub = registry.subscribe(&[BUTTON], EdgeFilter::Both).unwrap();

    mock.set_failure(BUTTON, Some(MockFailure::Fault)).unwrap();
    let fault = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("fault in time");
    assert!(matches!(fault, Some(Notification::Fault(_))));
    assert!(!mock.has_raw_subscriber(BUTTON).unwrap());

    mock.set_failure(BUTTON, None).unwrap();
    registry.reset(BUTTON).unwrap();
    assert!(!registry.is_degraded(BUTTON));
    assert!(mock.has_raw_subscriber(BUTTON).unwrap());

    mock.set_input_level(BUTTON, true).unwrap();
    let edge = next_edge(&sub, Duration::from_secs(2))
        .await
        .expect("sampling resumed");
    assert_eq!(edge.direction, EdgeDirection::Rising);
    assert_eq!(edge.sequence, 0);
}

#[tokio::test]
async fn set_debounce_applies_to_a_live_watch() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 100, 16);
    let _button = registry.acquire(BUTTON, PinMode::Input).unwrap();
    let sub = registry.subscribe(&[BUTTON], EdgeFilter::Both).unwrap();

    // a 40 ms pulse is a glitch under a 100 ms window
    mock.set_input_level(BUTTON, true).unwrap();
    thread::sleep(Duration::from_millis(40));
    mock.set_input_level(BUTTON, false).unwrap();
    assert!(next_edge(&sub, Duration::from_millis(150)).await.is_none());

    registry
        .set_debounce(BUTTON, Duration::from_millis(20))
        .unwrap();
    mock.set_input_level(BUTTON, true).unwrap();
    thread::sleep(Duration::from_millis(40));
    mock.set_input_level(BUTTON, false).unwrap();

    let edge = next_edge(&sub, Duration::from_secs(2))
        .await
        .expect("pulse longer than the new window");
    assert_eq!(edge.direction, EdgeDirection::Rising);
    assert_eq!(edge.sequence, 0);
}

#[test]
fn polled_transient_failure_is_reported_once() {
    let mock = MockGpioBackend::polling(8);
    let registry = registry_with(&mock, 0, 16);
    let _sensor = registry.acquire(SENSOR, PinMode::Input).unwrap();
    let sub = registry.subscribe(&[SENSOR], EdgeFilter::Both).unwrap();

    mock.set_failure(SENSOR, Some(MockFailure::Unavailable)).unwrap();
    let fault = sub
        .recv_timeout(Duration::from_secs(2))
        .expect("transient fault");
    assert!(matches!(fault, Notification::Fault(ref f) if f.error.is_transient()));

    thread::sleep(Duration::from_millis(30));
    assert!(sub.try_recv_fault().is_none());
    assert!(!registry.is_degraded(SENSOR));

    mock.set_failure(SENSOR, None).unwrap();
    mock.set_input_level(SENSOR, true).unwrap();
    let Some(Notification::Edge(edge)) = sub.recv_timeout(Duration::from_secs(2)) else {
        panic!("pin should recover");
    };
    assert_eq!(edge.direction, EdgeDirection::Rising);
}

#[test]
fn nothing_arrives_after_unsubscribe() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 0, 16);
    let _button = registry.acquire(BUTTON, PinMode::Input).unwrap();
    let sub = registry.subscribe(&[BUTTON], EdgeFilter::Both).unwrap();
    let count = registry.dispatcher().subscription_count();

    registry.unsubscribe(&sub);
    sub.cancel();
    assert!(sub.is_cancelled());
    assert_eq!(registry.dispatcher().subscription_count(), count - 1);

    mock.set_input_level(BUTTON, true).unwrap();
    thread::sleep(Duration::from_millis(30));
    assert!(sub.try_recv().is_none());
}

#[test]
fn callback_never_runs_after_cancel() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 0, 16);
    let _button = registry.acquire(BUTTON, PinMode::Input).unwrap();

    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();
    let sub = registry
        .subscribe_with(&[BUTTON], EdgeFilter::Both, move |_| {
            *counter.lock().unwrap() += 1;
        })
        .unwrap();

    mock.set_input_level(BUTTON, true).unwrap();
    assert!(wait_until(Duration::from_secs(2), || *calls.lock().unwrap() == 1));

    sub.cancel();
    let after_cancel = *calls.lock().unwrap();
    mock.set_input_level(BUTTON, false).unwrap();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(*calls.lock().unwrap(), after_cancel);
}

#[test]
fn released_pin_stops_emitting() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 0, 16);
    let button = registry.acquire(BUTTON, PinMode::Input).unwrap();
    let sub = registry.subscribe(&[BUTTON], EdgeFilter::Both).unwrap();

    mock.set_input_level(BUTTON, true).unwrap();
    let edge = sub.recv_timeout(Duration::from_secs(2));
    assert!(matches!(edge, Some(Notification::Edge(_))));

    registry.release(&button);
    assert!(!mock.has_raw_subscriber(BUTTON).unwrap());
    mock.set_input_level(BUTTON, false).unwrap();
    thread::sleep(Duration::from_millis(30));
    assert!(sub.try_recv().is_none());
    assert_eq!(registry.pin_state(BUTTON), None);

    // sequence numbers carry on for the pin's next owner
    let _again = registry.acquire(BUTTON, PinMode::Input).unwrap();
    mock.set_input_level(BUTTON, true).unwrap();
    let Some(Notification::Edge(edge)) = sub.recv_timeout(Duration::from_secs(2)) else {
        panic!("edge after reacquire");
    };
    assert_eq!(edge.sequence, 1);
}

#[test]
fn subscribe_rejects_unknown_pins() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 0, 16);
    assert!(matches!(
        registry.subscribe(&[PinId(12)], EdgeFilter::Both),
        Err(GpioError::InvalidPin(PinId(12)))
    ));
}

#[tokio::test]
async fn shutdown_closes_subscriptions() {
    let mock = MockGpioBackend::new(8);
    let registry = registry_with(&mock, 0, 16);
    let sub = registry.subscribe(&[BUTTON], EdgeFilter::Both).unwrap();
    registry.shutdown();
    let closed = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await;
    assert!(matches!(closed, Ok(None)));
}
