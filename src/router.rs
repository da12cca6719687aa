//! Event router for one namespace connection
//!
//! Inbound events are dispatched synchronously, in arrival order, to the
//! handlers registered for their name (in registration order). Outbound
//! events are validated, serialized and queued for the connection driver.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::connection::{ConnectionState, Lifecycle, Outbound};
use crate::error::{ActionError, ProtocolError};
use crate::observer::{Subscribers, Subscription};
use crate::protocol::Namespace;

/// Names the Socket.IO client reserves for its own signals
const RESERVED_EVENTS: &[&str] = &[
    "connect",
    "connect_error",
    "disconnect",
    "disconnecting",
    "newListener",
    "removeListener",
];

type RawHandler = Arc<dyn Fn(&Value) + Send + Sync>;

pub struct EventRouter {
    namespace: Namespace,
    handlers: Mutex<HashMap<String, Vec<(Subscription, RawHandler)>>>,
    lifecycle: Subscribers<Lifecycle>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<ConnectionState>,
}

impl EventRouter {
    pub(crate) fn new(
        namespace: Namespace,
        outbound: mpsc::UnboundedSender<Outbound>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            namespace,
            handlers: Mutex::new(HashMap::new()),
            lifecycle: Subscribers::new(),
            outbound,
            state,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Register a typed handler.
    ///
    /// The payload is deserialized into `T` before the handler runs; payloads
    /// that do not fit are logged and dropped.
    pub fn on<T, F>(&self, event: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = event.to_string();
        self.on_raw(event, move |payload| match T::deserialize(payload) {
            Ok(value) => handler(value),
            Err(source) => {
                let err = ProtocolError::Payload {
                    event: name.clone(),
                    source,
                };
                tracing::warn!("Dropping event: {}", err);
            }
        })
    }

    /// Register a handler that receives the raw JSON payload
    pub fn on_raw<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let subscription = Subscription::next();
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((subscription, Arc::new(handler)));
        subscription
    }

    /// Register for connection lifecycle signals
    pub fn on_lifecycle<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Lifecycle) + Send + Sync + 'static,
    {
        self.lifecycle.subscribe(handler)
    }

    /// Remove an event or lifecycle handler
    pub fn off(&self, subscription: Subscription) -> bool {
        if self.lifecycle.unsubscribe(subscription) {
            return true;
        }

        let mut handlers = self.handlers.lock();
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(id, _)| *id != subscription);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.lock().get(event).map_or(0, Vec::len)
    }

    /// Validate, serialize and queue an outbound event.
    ///
    /// Fails with `NotConnected` unless the namespace is connected; nothing
    /// is buffered for later delivery.
    pub fn emit<T>(&self, event: &str, payload: &T) -> Result<(), ActionError>
    where
        T: Serialize + ?Sized,
    {
        if event.is_empty() || RESERVED_EVENTS.contains(&event) {
            return Err(ActionError::InvalidEvent(event.to_string()));
        }

        let data =
            serde_json::to_value(payload).map_err(|e| ActionError::Serialize(e.to_string()))?;

        if !matches!(*self.state.borrow(), ConnectionState::Connected) {
            return Err(ActionError::NotConnected);
        }

        tracing::debug!(namespace = %self.namespace, event, "Emitting event");
        self.outbound
            .send(Outbound::Event {
                name: event.to_string(),
                data,
            })
            .map_err(|_| ActionError::NotConnected)
    }

    /// Deliver an inbound event to its handlers
    pub(crate) fn dispatch(&self, event: &str, payload: &Value) {
        let snapshot: Vec<RawHandler> = match self.handlers.lock().get(event) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => Vec::new(),
        };

        if snapshot.is_empty() {
            tracing::debug!(namespace = %self.namespace, event, "No handler for event");
            return;
        }

        for handler in snapshot {
            handler(payload);
        }
    }

    pub(crate) fn dispatch_lifecycle(&self, signal: &Lifecycle) {
        self.lifecycle.notify(signal);
    }
}

/// Unit payload for events that carry no data (`connected`, `pong`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct Empty;

impl From<Value> for Empty {
    fn from(_: Value) -> Self {
        Empty
    }
}

impl From<Empty> for Value {
    fn from(_: Empty) -> Self {
        Value::Null
    }
}
