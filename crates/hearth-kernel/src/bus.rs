//! Publish/subscribe event bus.
//!
//! Named handlers subscribe to event types; a single dedicated worker thread
//! drains a FIFO queue and delivers each event to the current subscribers of
//! its type.  Delivery back to the event's source is suppressed.  Handlers
//! run serially on the bus worker; a panicking handler is logged and does
//! not abort delivery to its siblings.
//!
//! Events emitted from one source are delivered in emission order; no
//! ordering is guaranteed across sources, and synchronous emits (which run
//! on the caller's thread) observe no ordering relationship with the queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// A single value in an event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
    Map(HashMap<String, String>),
}

impl EventValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&str> for EventValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for EventValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for EventValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for EventValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for EventValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Event payload map.
pub type EventData = HashMap<String, EventValue>;

/// An event flowing through the bus.  Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub data: EventData,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: &str, data: EventData, source: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            source: source.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Receiver side of the bus; implemented by modules.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event_type: &str, data: &EventData);
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Handler and subscription tables.  One lock over both so that
/// unregistering a handler purges its subscriptions atomically.
#[derive(Default)]
struct Tables {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    subscriptions: HashMap<String, HashSet<String>>,
}

struct BusInner {
    tables: RwLock<Tables>,
    queue: Mutex<VecDeque<Event>>,
    available: Condvar,
    running: AtomicBool,
}

/// Thread-safe publish/subscribe event bus.
pub struct EventBus {
    inner: Arc<BusInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                tables: RwLock::new(Tables::default()),
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the delivery worker.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *self.worker.lock() = Some(std::thread::spawn(move || process_events(&inner)));
        tracing::info!("event bus started");
    }

    /// Stop the delivery worker.  Undelivered queued events are dropped.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.inner.available.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        tracing::info!("event bus stopped");
    }

    /// Register a named handler.  Re-registering a name replaces the handler
    /// but keeps its subscriptions.
    pub fn register_handler(&self, name: &str, handler: Arc<dyn EventHandler>) {
        self.inner
            .tables
            .write()
            .handlers
            .insert(name.to_string(), handler);
        tracing::debug!(handler = name, "event handler registered");
    }

    /// Remove a handler and purge all of its subscriptions in one step.
    pub fn unregister_handler(&self, name: &str) {
        let mut tables = self.inner.tables.write();
        tables.handlers.remove(name);
        for subscribers in tables.subscriptions.values_mut() {
            subscribers.remove(name);
        }
        tracing::debug!(handler = name, "event handler unregistered");
    }

    /// Subscribe a registered handler to an event type.  Fails (returns
    /// false) if the name has no registered handler.
    pub fn subscribe(&self, event_type: &str, name: &str) -> bool {
        let mut tables = self.inner.tables.write();
        if !tables.handlers.contains_key(name) {
            tracing::warn!(handler = name, event_type, "cannot subscribe unregistered handler");
            return false;
        }
        tables
            .subscriptions
            .entry(event_type.to_string())
            .or_default()
            .insert(name.to_string());
        tracing::debug!(handler = name, event_type, "subscribed");
        true
    }

    /// Remove one subscription.
    pub fn unsubscribe(&self, event_type: &str, name: &str) {
        let mut tables = self.inner.tables.write();
        if let Some(subscribers) = tables.subscriptions.get_mut(event_type) {
            subscribers.remove(name);
        }
    }

    /// Queue an event for asynchronous delivery.
    pub fn emit(&self, event_type: &str, data: EventData, source: &str) -> bool {
        let event = Event::new(event_type, data, source);
        self.inner.queue.lock().push_back(event);
        self.inner.available.notify_one();
        true
    }

    /// Deliver an event on the caller's thread, bypassing the queue.
    pub fn emit_sync(&self, event_type: &str, data: EventData, source: &str) {
        let event = Event::new(event_type, data, source);
        deliver_event(&self.inner, &event);
    }

    /// Number of events waiting for delivery.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn process_events(inner: &BusInner) {
    tracing::debug!("event bus worker started");

    loop {
        let event = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(event) = queue.pop_front() {
                    break event;
                }
                if !inner.running.load(Ordering::Acquire) {
                    tracing::debug!("event bus worker stopped");
                    return;
                }
                inner.available.wait(&mut queue);
            }
        };

        deliver_event(inner, &event);

        if !inner.running.load(Ordering::Acquire) {
            tracing::debug!("event bus worker stopped");
            return;
        }
    }
}

fn deliver_event(inner: &BusInner, event: &Event) {
    // Snapshot the target handlers so no table lock is held while handlers
    // run; a handler may re-enter the bus (emit, subscribe) freely.
    let targets: Vec<(String, Arc<dyn EventHandler>)> = {
        let tables = inner.tables.read();
        let Some(subscribers) = tables.subscriptions.get(&event.event_type) else {
            tracing::trace!(event_type = %event.event_type, "no subscribers");
            return;
        };
        subscribers
            .iter()
            .filter(|name| **name != event.source)
            .filter_map(|name| {
                tables
                    .handlers
                    .get(name)
                    .map(|handler| (name.clone(), Arc::clone(handler)))
            })
            .collect()
    };

    tracing::trace!(
        event_type = %event.event_type,
        source = %event.source,
        subscribers = targets.len(),
        "delivering event"
    );

    for (name, handler) in targets {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            handler.handle_event(&event.event_type, &event.data);
        }));
        if result.is_err() {
            tracing::error!(
                event_type = %event.event_type,
                handler = %name,
                "event handler panicked"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
