//! Typed publish/subscribe bus — the coordination spine of the engine.
//!
//! Publishing is synchronous and re-entrant: all handlers registered at the
//! moment of the call run on the publishing caller, in registration order,
//! and a nested publish completes depth-first before the outer handler list
//! resumes. Handlers added during a publish do not see the in-flight message.
//!
//! A failing handler is logged and skipped; it never poisons later handlers
//! or the publisher. The bus retains a bounded history of delivered messages
//! for introspection and replay-style tests.

pub mod message;

pub use message::{EventType, Message, Payload};

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;
use thiserror::Error;

/// Default bounded history length.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// Outcome of a handler invocation. Errors are isolated by the bus.
pub type HandlerResult = Result<(), Box<dyn std::error::Error>>;

/// Subscription target: a single event type or every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    All,
    Type(EventType),
}

/// Handle identifying a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Bus-level errors surfaced to callers of `request`.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("no responder registered for {0:?}")]
    HandlerMissing(EventType),

    #[error("request {0:?} received no response within the timeout window")]
    Timeout(EventType),

    #[error("message carries no correlation id; cannot respond")]
    NotARequest,
}

type Handler = Rc<RefCell<dyn FnMut(&Message) -> HandlerResult>>;

struct SubscriberEntry {
    id: SubscriptionId,
    handler: Handler,
}

/// The event bus. Single-threaded by design; share it via `Rc`.
pub struct EventBus {
    subscribers: RefCell<HashMap<Topic, Vec<SubscriberEntry>>>,
    history: RefCell<VecDeque<Message>>,
    history_limit: Cell<usize>,
    next_subscription_id: Cell<u64>,
    next_correlation_id: Cell<u64>,
    /// Engine clock; stamps every published message.
    clock: Cell<i64>,
    handler_failures: Cell<u64>,
}

impl EventBus {
    pub fn new() -> Rc<Self> {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(limit: usize) -> Rc<Self> {
        Rc::new(Self {
            subscribers: RefCell::new(HashMap::new()),
            history: RefCell::new(VecDeque::new()),
            history_limit: Cell::new(limit.max(1)),
            next_subscription_id: Cell::new(0),
            next_correlation_id: Cell::new(0),
            clock: Cell::new(0),
            handler_failures: Cell::new(0),
        })
    }

    // ── Clock ──────────────────────────────────────────────────────────

    /// Advance the bus clock; subsequent messages are stamped with `time`.
    pub fn set_time(&self, time: i64) {
        self.clock.set(time);
    }

    pub fn now(&self) -> i64 {
        self.clock.get()
    }

    // ── Subscription ───────────────────────────────────────────────────

    /// Register a handler for a topic. Dropping the returned handle removes
    /// the subscriber.
    pub fn subscribe<F>(self: &Rc<Self>, topic: Topic, handler: F) -> Subscription
    where
        F: FnMut(&Message) -> HandlerResult + 'static,
    {
        let id = SubscriptionId(self.next_subscription_id.get());
        self.next_subscription_id.set(id.0 + 1);
        self.subscribers
            .borrow_mut()
            .entry(topic)
            .or_default()
            .push(SubscriberEntry {
                id,
                handler: Rc::new(RefCell::new(handler)),
            });
        Subscription {
            bus: Rc::downgrade(self),
            id,
        }
    }

    /// Remove a subscriber by id. Returns whether anything was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut map = self.subscribers.borrow_mut();
        let mut removed = false;
        for entries in map.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            removed |= entries.len() != before;
        }
        removed
    }

    fn has_subscriber(&self, event_type: EventType) -> bool {
        let map = self.subscribers.borrow();
        let typed = map
            .get(&Topic::Type(event_type))
            .is_some_and(|v| !v.is_empty());
        let wildcard = map.get(&Topic::All).is_some_and(|v| !v.is_empty());
        typed || wildcard
    }

    // ── Publishing ─────────────────────────────────────────────────────

    /// Publish a message to every handler registered for its type or for
    /// the wildcard topic, in registration order.
    pub fn publish(&self, event_type: EventType, source: &str, payload: Payload) -> Message {
        self.publish_message(Message {
            event_type,
            timestamp: self.clock.get(),
            source: source.to_string(),
            correlation_id: None,
            payload,
        })
    }

    fn publish_message(&self, message: Message) -> Message {
        {
            let mut history = self.history.borrow_mut();
            history.push_back(message.clone());
            while history.len() > self.history_limit.get() {
                history.pop_front();
            }
        }

        // Snapshot the handler list before invoking anything: subscribers
        // added by a handler must not see the in-flight message, and the
        // map borrow must not be held across re-entrant publishes.
        let snapshot: Vec<(SubscriptionId, Handler)> = {
            let map = self.subscribers.borrow();
            let mut entries: Vec<(SubscriptionId, Handler)> = map
                .get(&Topic::Type(message.event_type))
                .into_iter()
                .chain(map.get(&Topic::All))
                .flatten()
                .map(|e| (e.id, Rc::clone(&e.handler)))
                .collect();
            // Subscription ids are monotonic, so this restores global
            // registration order across the typed and wildcard lists.
            entries.sort_by_key(|(id, _)| *id);
            entries
        };

        for (id, handler) in snapshot {
            // A handler still borrowed here means it re-entered itself via
            // a nested publish; skip the nested delivery.
            let Ok(mut handler) = handler.try_borrow_mut() else {
                continue;
            };
            if let Err(err) = handler(&message) {
                self.handler_failures.set(self.handler_failures.get() + 1);
                eprintln!(
                    "event bus: handler {} failed on {:?}: {err}",
                    id.0, message.event_type
                );
            }
        }

        message
    }

    // ── Request / response ─────────────────────────────────────────────

    /// Publish a request and wait for a correlated [`EventType::Response`].
    ///
    /// The bus is synchronous, so a responder must answer during the publish
    /// itself; `_timeout` exists for interface parity and an unanswered
    /// request fails immediately with [`BusError::Timeout`].
    pub fn request(
        self: &Rc<Self>,
        event_type: EventType,
        source: &str,
        payload: Payload,
        _timeout: Duration,
    ) -> Result<Message, BusError> {
        if !self.has_subscriber(event_type) {
            return Err(BusError::HandlerMissing(event_type));
        }

        let correlation_id = self.next_correlation_id.get();
        self.next_correlation_id.set(correlation_id + 1);

        let slot: Rc<RefCell<Option<Message>>> = Rc::new(RefCell::new(None));
        let captured = Rc::clone(&slot);
        let _responder = self.subscribe(Topic::Type(EventType::Response), move |msg| {
            if msg.correlation_id == Some(correlation_id) {
                *captured.borrow_mut() = Some(msg.clone());
            }
            Ok(())
        });

        self.publish_message(Message {
            event_type,
            timestamp: self.clock.get(),
            source: source.to_string(),
            correlation_id: Some(correlation_id),
            payload,
        });

        let response = slot.borrow_mut().take();
        response.ok_or(BusError::Timeout(event_type))
    }

    /// Publish the [`EventType::Response`] paired with `request`.
    pub fn respond(
        &self,
        request: &Message,
        source: &str,
        payload: Payload,
    ) -> Result<Message, BusError> {
        let correlation_id = request.correlation_id.ok_or(BusError::NotARequest)?;
        Ok(self.publish_message(Message {
            event_type: EventType::Response,
            timestamp: self.clock.get(),
            source: source.to_string(),
            correlation_id: Some(correlation_id),
            payload,
        }))
    }

    // ── History & diagnostics ──────────────────────────────────────────

    pub fn history_snapshot(&self) -> Vec<Message> {
        self.history.borrow().iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.borrow().len()
    }

    pub fn set_history_limit(&self, limit: usize) {
        self.history_limit.set(limit.max(1));
        let mut history = self.history.borrow_mut();
        while history.len() > self.history_limit.get() {
            history.pop_front();
        }
    }

    pub fn clear_history(&self) {
        self.history.borrow_mut().clear();
    }

    /// Number of handler invocations that returned an error.
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.get()
    }
}

/// RAII subscription handle. Dropping it unsubscribes the handler.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: SubscriptionId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}
