use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;

use crate::error::{GpioError, GpioResult};
use crate::gpio::{EdgeEvent, EdgeFilter, PinFault, PinId};

const DELIVERY_IDLE_WAIT: Duration = Duration::from_millis(100);

pub type SubscriptionId = u64;

#[derive(Debug, Clone)]
pub enum Notification {
    Edge(EdgeEvent),
    Fault(PinFault),
}

struct QueueState {
    events: VecDeque<EdgeEvent>,
    faults: VecDeque<PinFault>,
    closed: bool,
}

struct SubscriptionQueue {
    id: SubscriptionId,
    pins: FxHashSet<PinId>,
    filter: EdgeFilter,
    capacity: usize,
    fault_capacity: usize,
    state: Mutex<QueueState>,
    ready: Condvar,
    notify: Notify,
    dropped: AtomicU64,
    dropped_faults: AtomicU64,
    // held by a delivery thread while its consumer runs
    delivering: Mutex<()>,
}

impl SubscriptionQueue {
    fn wants(&self, pin: PinId) -> bool {
        self.pins.contains(&pin)
    }

    fn push_event(&self, event: EdgeEvent) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            while state.events.len() >= self.capacity {
                state.events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.events.push_back(event);
        }
        self.wake();
    }

    fn push_fault(&self, fault: PinFault) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            while state.faults.len() >= self.fault_capacity {
                state.faults.pop_front();
                self.dropped_faults.fetch_add(1, Ordering::Relaxed);
            }
            state.faults.push_back(fault);
        }
        self.wake();
    }

    fn wake(&self) {
        self.ready.notify_all();
        self.notify.notify_one();
    }

    fn pop_locked(state: &mut QueueState) -> Option<Notification> {
        if state.closed {
            return None;
        }
        if let Some(fault) = state.faults.pop_front() {
            return Some(Notification::Fault(fault));
        }
        state.events.pop_front().map(Notification::Edge)
    }

    fn pop(&self) -> Option<Notification> {
        Self::pop_locked(&mut self.state.lock())
    }

    fn pop_fault(&self) -> Option<PinFault> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.faults.pop_front()
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<Notification> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(n) = Self::pop_locked(&mut state) {
                return Some(n);
            }
            if state.closed {
                return None;
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return Self::pop_locked(&mut state);
            }
        }
    }

    /// Wait until something is queued or the queue closes.
    fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed || !state.events.is_empty() || !state.faults.is_empty() {
                return true;
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.events.clear();
            state.faults.clear();
        }
        self.ready.notify_all();
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// Fans edge events and sampling faults out to subscriptions.
///
/// Every subscription owns a bounded queue. When a consumer falls behind the
/// oldest queued event is discarded and counted, so the producer never waits.
pub struct Dispatcher {
    subscriptions: RwLock<FxHashMap<SubscriptionId, Arc<SubscriptionQueue>>>,
    next_id: AtomicU64,
    capacity: usize,
    fault_capacity: usize,
}

impl Dispatcher {
    pub fn new(capacity: usize, fault_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            fault_capacity: fault_capacity.max(1),
        })
    }

    pub fn subscribe<I>(self: &Arc<Self>, pins: I, filter: EdgeFilter) -> Subscription
    where
        I: IntoIterator<Item = PinId>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriptionQueue {
            id,
            pins: pins.into_iter().collect(),
            filter,
            capacity: self.capacity,
            fault_capacity: self.fault_capacity,
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(self.capacity),
                faults: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            dropped_faults: AtomicU64::new(0),
            delivering: Mutex::new(()),
        });
        self.subscriptions.write().insert(id, queue.clone());
        debug!("subscription {id} registered for {} pin(s)", queue.pins.len());

        Subscription {
            queue,
            dispatcher: Arc::downgrade(self),
            delivery_thread: None,
        }
    }

    /// Subscribe with a callback consumer. The callback runs on a dedicated
    /// delivery thread and is never invoked after `cancel` returns.
    pub fn subscribe_with<I, F>(
        self: &Arc<Self>,
        pins: I,
        filter: EdgeFilter,
        mut consumer: F,
    ) -> GpioResult<Subscription>
    where
        I: IntoIterator<Item = PinId>,
        F: FnMut(Notification) + Send + 'static,
    {
        let mut subscription = self.subscribe(pins, filter);
        let queue = subscription.queue.clone();

        let handle = thread::Builder::new()
            .name(format!("pinctl-delivery-{}", queue.id))
            .spawn(move || {
                loop {
                    if !queue.wait_ready(DELIVERY_IDLE_WAIT) {
                        continue;
                    }
                    let _delivering = queue.delivering.lock();
                    match queue.pop() {
                        Some(notification) => consumer(notification),
                        None if queue.is_closed() => break,
                        None => {}
                    }
                }
                debug!("delivery thread for subscription {} exiting", queue.id);
            })
            .map_err(|e| GpioError::BackendUnavailable(format!("spawn delivery thread: {e}")))?;
        subscription.delivery_thread = Some(handle.thread().id());
        Ok(subscription)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.cancel();
    }

    fn remove(&self, id: SubscriptionId) {
        let removed = self.subscriptions.write().remove(&id);
        if let Some(queue) = removed {
            queue.close();
            debug!("subscription {id} cancelled");
        }
    }

    pub(crate) fn dispatch(&self, event: EdgeEvent) {
        let subscriptions = self.subscriptions.read();
        for queue in subscriptions.values() {
            if queue.wants(event.pin) && queue.filter.matches(event.direction) {
                queue.push_event(event);
            }
        }
    }

    pub(crate) fn report_fault(&self, fault: &PinFault) {
        let subscriptions = self.subscriptions.read();
        for queue in subscriptions.values() {
            if queue.wants(fault.pin) {
                queue.push_fault(fault.clone());
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub(crate) fn close_all(&self) {
        let drained: Vec<_> = self.subscriptions.write().drain().collect();
        for (_, queue) in drained {
            queue.close();
        }
    }
}

/// A live registration with the [`Dispatcher`]. Dropping it unsubscribes.
pub struct Subscription {
    queue: Arc<SubscriptionQueue>,
    dispatcher: Weak<Dispatcher>,
    delivery_thread: Option<ThreadId>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.queue.id
    }

    pub fn pins(&self) -> impl Iterator<Item = PinId> + '_ {
        self.queue.pins.iter().copied()
    }

    pub fn filter(&self) -> EdgeFilter {
        self.queue.filter
    }

    /// Events discarded because this subscription's queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn dropped_faults(&self) -> u64 {
        self.queue.dropped_faults.load(Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.queue.is_closed()
    }

    /// Next queued notification; faults come before edge events.
    pub fn try_recv(&self) -> Option<Notification> {
        self.queue.pop()
    }

    /// Next sampling fault, leaving queued edge events untouched.
    pub fn try_recv_fault(&self) -> Option<PinFault> {
        self.queue.pop_fault()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        self.queue.pop_timeout(timeout)
    }

    /// Wait for the next notification. Returns `None` once cancelled.
    pub async fn recv(&self) -> Option<Notification> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(notification) = self.queue.pop() {
                return Some(notification);
            }
            if self.queue.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Convenience over [`recv`](Self::recv) that skips faults.
    pub async fn next_edge(&self) -> Option<EdgeEvent> {
        loop {
            match self.recv().await? {
                Notification::Edge(event) => return Some(event),
                Notification::Fault(_) => continue,
            }
        }
    }

    /// Idempotent. Nothing is delivered to this subscription once it returns.
    pub fn cancel(&self) {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.remove(self.queue.id),
            None => self.queue.close(),
        }
        if self.delivery_thread.is_some() && self.delivery_thread != Some(thread::current().id()) {
            // wait out a callback that was already running
            drop(self.queue.delivering.lock());
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
