//! In-process publish/subscribe bus.
//!
//! One lock guards the subscriber map and the history ring. Delivery happens
//! outside the lock: sync subscribers run inline on the publishing thread,
//! async subscribers are spawned on the tokio runtime (or on a small fallback
//! runtime owned by the bus when the publisher has none).
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use futures::FutureExt;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use strum::IntoEnumIterator;
use thiserror::Error;
use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};
use tracing::{debug, error, warn};
use wiseflow_plugin::{AsyncEventHandler, Event, EventCallback, EventType, SubscriptionId, event::SyncEventFn};

use crate::{logger::metrics, util::panic_message};

pub const DEFAULT_MAX_HISTORY: usize = 1000;
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the history ring.
    pub max_history: usize,
    /// Upper bound for one subscriber invocation.
    pub callback_timeout: Duration,
    /// Consecutive failures after which a subscriber is dropped.
    pub max_consecutive_failures: u32,
    /// Return an aggregate error from publish when any subscriber failed.
    /// Delivery to the remaining subscribers happens either way.
    pub propagate_errors: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            callback_timeout: Duration::from_secs(5),
            max_consecutive_failures: 3,
            propagate_errors: false,
        }
    }
}

/// One failed subscriber invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberFailure {
    pub subscription: SubscriptionId,
    pub source: Option<String>,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("{} subscriber(s) failed handling {event_type} event {event_id}", .failures.len())]
    SubscriberFailures {
        event_type: EventType,
        event_id: String,
        failures: Vec<SubscriberFailure>,
    },
}

struct Registration {
    id: SubscriptionId,
    callback: EventCallback,
    source: Option<String>,
    failures: AtomicU32,
}

struct BusState {
    subscribers: HashMap<EventType, Vec<Arc<Registration>>>,
    history: VecDeque<Event>,
    max_history: usize,
}

struct BusInner {
    state: Mutex<BusState>,
    enabled: AtomicBool,
    next_id: AtomicU64,
    callback_timeout: Duration,
    max_consecutive_failures: u32,
    propagate_errors: bool,
    fallback_runtime: Mutex<Option<Runtime>>,
}

impl BusInner {
    fn remove_registration(&self, id: SubscriptionId) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        for regs in state.subscribers.values_mut() {
            let before = regs.len();
            regs.retain(|r| r.id != id);
            removed += before - regs.len();
        }
        removed
    }

    /// Updates the consecutive failure counter and drops the registration once
    /// it reaches the threshold.
    fn record_outcome(&self, reg: &Registration, event_type: EventType, outcome: &Result<(), String>) {
        match outcome {
            Ok(()) => reg.failures.store(0, Ordering::SeqCst),
            Err(reason) => {
                metrics()
                    .subscriber_failures
                    .add(1, &[KeyValue::new("event_type", event_type.to_string())]);
                let failures = reg.failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    subscription = %reg.id,
                    source = reg.source.as_deref().unwrap_or("-"),
                    %event_type,
                    failures,
                    "subscriber failed: {}",
                    reason
                );
                if self.max_consecutive_failures > 0 && failures >= self.max_consecutive_failures {
                    let removed = self.remove_registration(reg.id);
                    if removed > 0 {
                        error!(
                            subscription = %reg.id,
                            source = reg.source.as_deref().unwrap_or("-"),
                            "subscriber failed {} times in a row, unsubscribing",
                            failures
                        );
                    }
                }
            }
        }
    }

    fn runtime_handle(&self) -> Option<Handle> {
        if let Ok(handle) = Handle::try_current() {
            return Some(handle);
        }
        let mut guard = self.fallback_runtime.lock();
        if guard.is_none() {
            match Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("wiseflow-event-bus")
                .enable_time()
                .build()
            {
                Ok(rt) => *guard = Some(rt),
                Err(e) => {
                    error!("could not start fallback runtime for async subscribers: {e}");
                    return None;
                }
            }
        }
        guard.as_ref().map(|rt| rt.handle().clone())
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        // may run inside an async context, where a blocking drop would panic
        if let Some(rt) = self.fallback_runtime.get_mut().take() {
            rt.shutdown_background();
        }
    }
}

/// The process-wide event bus. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState {
                    subscribers: HashMap::new(),
                    history: VecDeque::with_capacity(config.max_history.min(DEFAULT_MAX_HISTORY)),
                    max_history: config.max_history,
                }),
                enabled: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                callback_timeout: config.callback_timeout,
                max_consecutive_failures: config.max_consecutive_failures,
                propagate_errors: config.propagate_errors,
                fallback_runtime: Mutex::new(None),
            }),
        }
    }

    /// Registers `callback` for `event_type`, or for every type when `None`.
    /// Registering the same callback twice delivers twice.
    pub fn subscribe(
        &self,
        event_type: Option<EventType>,
        callback: EventCallback,
        source: Option<&str>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let reg = Arc::new(Registration {
            id,
            callback,
            source: source.map(str::to_string),
            failures: AtomicU32::new(0),
        });
        let mut state = self.inner.state.lock();
        match event_type {
            Some(t) => state.subscribers.entry(t).or_default().push(reg),
            None => {
                for t in EventType::iter() {
                    state.subscribers.entry(t).or_default().push(reg.clone());
                }
            }
        }
        debug!(subscription = %id, ?event_type, source, "subscribed");
        id
    }

    /// Shorthand for an inline subscriber.
    pub fn subscribe_fn<F>(&self, event_type: Option<EventType>, source: Option<&str>, f: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(event_type, EventCallback::sync(f), source)
    }

    /// Shorthand for an async handler.
    pub fn subscribe_handler(
        &self,
        event_type: Option<EventType>,
        source: Option<&str>,
        handler: Arc<dyn AsyncEventHandler>,
    ) -> SubscriptionId {
        self.subscribe(event_type, EventCallback::handler(handler), source)
    }

    /// Removes the first registration of `callback` for `event_type`.
    /// Returns false when there was none.
    pub fn unsubscribe(&self, event_type: EventType, callback: &EventCallback) -> bool {
        let mut state = self.inner.state.lock();
        let Some(regs) = state.subscribers.get_mut(&event_type) else {
            return false;
        };
        match regs.iter().position(|r| r.callback.same_as(callback)) {
            Some(pos) => {
                regs.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Removes the registration behind `id` from every type it was registered for.
    pub fn unsubscribe_id(&self, id: SubscriptionId) -> bool {
        self.inner.remove_registration(id) > 0
    }

    /// Removes every registration owned by `source`. Returns how many
    /// (type, callback) pairs were dropped.
    pub fn unsubscribe_by_source(&self, source: &str) -> usize {
        let mut state = self.inner.state.lock();
        let mut removed = 0;
        for regs in state.subscribers.values_mut() {
            let before = regs.len();
            regs.retain(|r| r.source.as_deref() != Some(source));
            removed += before - regs.len();
        }
        if removed > 0 {
            debug!(source, removed, "unsubscribed by source");
        }
        removed
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner
            .state
            .lock()
            .subscribers
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Appends to history and snapshots the subscribers, under the lock.
    fn record(&self, event: &Event) -> Option<Vec<Arc<Registration>>> {
        if !self.is_enabled() {
            debug!(event_type = %event.event_type(), "event bus disabled, dropping event");
            return None;
        }
        let mut state = self.inner.state.lock();
        state.history.push_back(event.clone());
        while state.history.len() > state.max_history {
            state.history.pop_front();
        }
        let subscribers = state
            .subscribers
            .get(&event.event_type())
            .cloned()
            .unwrap_or_default();
        drop(state);

        metrics()
            .events_published
            .add(1, &[KeyValue::new("event_type", event.event_type().to_string())]);
        Some(subscribers)
    }

    fn invoke_sync(&self, reg: &Registration, f: &Arc<SyncEventFn>, event: &Event) -> Result<(), String> {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| f(event)));
        let elapsed = started.elapsed();
        let result = match outcome {
            Ok(Ok(())) if elapsed <= self.inner.callback_timeout => Ok(()),
            Ok(Ok(())) => Err(format!(
                "exceeded timeout of {:?} (took {:?})",
                self.inner.callback_timeout, elapsed
            )),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
        };
        self.inner.record_outcome(reg, event.event_type(), &result);
        result
    }

    fn spawn_async(
        &self,
        reg: Arc<Registration>,
        handler: Arc<dyn AsyncEventHandler>,
        event: Event,
    ) -> Option<JoinHandle<Result<(), String>>> {
        let Some(handle) = self.inner.runtime_handle() else {
            let result = Err("no runtime available for async subscriber".to_string());
            self.inner.record_outcome(&reg, event.event_type(), &result);
            return None;
        };
        let inner: Weak<BusInner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.callback_timeout;
        Some(handle.spawn(async move {
            let event_type = event.event_type();
            let result = run_async_handler(handler, event, timeout).await;
            if let Some(inner) = inner.upgrade() {
                inner.record_outcome(&reg, event_type, &result);
            }
            result
        }))
    }

    /// Delivers `event` from any context without waiting on async
    /// subscribers: sync subscribers run inline, async ones are scheduled.
    ///
    /// Failing subscribers never stop delivery to the others; with
    /// `propagate_errors` the inline failures are returned afterwards.
    pub fn publish_sync(&self, event: Event) -> Result<(), EventBusError> {
        let Some(subscribers) = self.record(&event) else {
            return Ok(());
        };
        let mut failures = Vec::new();
        for reg in subscribers {
            match &reg.callback {
                EventCallback::Sync(f) => {
                    if let Err(reason) = self.invoke_sync(&reg, f, &event) {
                        failures.push(SubscriberFailure {
                            subscription: reg.id,
                            source: reg.source.clone(),
                            reason,
                        });
                    }
                }
                EventCallback::Async(h) => {
                    // detached; the task accounts for its own outcome
                    let _ = self.spawn_async(reg.clone(), h.clone(), event.clone());
                }
            }
        }
        self.finish(&event, failures)
    }

    /// Delivers `event` and waits until every async subscriber has finished
    /// or timed out, so their failures are accounted for before returning.
    /// The async subscribers still run as separate tasks.
    pub async fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let Some(subscribers) = self.record(&event) else {
            return Ok(());
        };
        let mut failures = Vec::new();
        let mut pending = Vec::new();
        for reg in subscribers {
            match &reg.callback {
                EventCallback::Sync(f) => {
                    if let Err(reason) = self.invoke_sync(&reg, f, &event) {
                        failures.push(SubscriberFailure {
                            subscription: reg.id,
                            source: reg.source.clone(),
                            reason,
                        });
                    }
                }
                EventCallback::Async(h) => {
                    match self.spawn_async(reg.clone(), h.clone(), event.clone()) {
                        Some(task) => pending.push((reg.clone(), task)),
                        None => failures.push(SubscriberFailure {
                            subscription: reg.id,
                            source: reg.source.clone(),
                            reason: "no runtime available for async subscriber".to_string(),
                        }),
                    }
                }
            }
        }

        let (regs, tasks): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
        let results = futures::future::join_all(tasks).await;
        for (reg, joined) in regs.into_iter().zip(results) {
            let reason = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(reason)) => reason,
                Err(join_err) => format!("task failed: {join_err}"),
            };
            failures.push(SubscriberFailure {
                subscription: reg.id,
                source: reg.source.clone(),
                reason,
            });
        }
        self.finish(&event, failures)
    }

    fn finish(&self, event: &Event, failures: Vec<SubscriberFailure>) -> Result<(), EventBusError> {
        if failures.is_empty() || !self.inner.propagate_errors {
            return Ok(());
        }
        Err(EventBusError::SubscriberFailures {
            event_type: event.event_type(),
            event_id: event.id().to_string(),
            failures,
        })
    }

    /// Most recent `limit` events, optionally of one type, oldest first.
    pub fn get_history(&self, event_type: Option<EventType>, limit: usize) -> Vec<Event> {
        let state = self.inner.state.lock();
        let mut events: Vec<Event> = state
            .history
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type() == t))
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    pub fn history_len(&self) -> usize {
        self.inner.state.lock().history.len()
    }

    pub fn clear_history(&self) {
        self.inner.state.lock().history.clear();
    }

    /// Changes the ring capacity, dropping the oldest entries if needed.
    pub fn set_max_history(&self, max_history: usize) {
        let mut state = self.inner.state.lock();
        state.max_history = max_history;
        while state.history.len() > max_history {
            state.history.pop_front();
        }
    }

    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // try_lock so Debug never deadlocks against a publisher
        let (types, history) = match self.inner.state.try_lock() {
            Some(state) => (state.subscribers.len(), state.history.len()),
            None => (usize::MAX, usize::MAX),
        };
        f.debug_struct("EventBus")
            .field("enabled", &self.is_enabled())
            .field("subscribed_types", &types)
            .field("history_len", &history)
            .finish()
    }
}

async fn run_async_handler(
    handler: Arc<dyn AsyncEventHandler>,
    event: Event,
    timeout: Duration,
) -> Result<(), String> {
    let fut = AssertUnwindSafe(async move { handler.handle(event).await }).catch_unwind();
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(format!("{e:#}")),
        Ok(Err(panic)) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
        Err(_) => Err(format!("exceeded timeout of {:?}", timeout)),
    }
}
