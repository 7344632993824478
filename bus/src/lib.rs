//! Lifecycle event bus for layout consumers, plugins, and live data sources.
//!
//! DESIGN
//! ======
//! One `EventBus` is created by the host at startup and handed to every
//! component that needs it; clones share the same subscriber table. Dispatch
//! is synchronous: `publish` runs each handler registered for the event name,
//! in registration order, before returning.
//!
//! The subscriber list is snapshotted under the lock and handlers run with the
//! lock released, so a handler may publish, subscribe, or unsubscribe on the
//! same bus. A registration removed mid-publish is skipped for the remainder
//! of that publish; a registration added mid-publish first sees the next one.
//!
//! ERROR HANDLING
//! ==============
//! Handler failures (an `Err` result or a panic) are logged and counted in the
//! returned [`Dispatch`]. They never reach the publisher and never stop the
//! remaining handlers.
//!
//! LIFECYCLE
//! =========
//! `shutdown` clears every subscription and closes the bus for good; nothing
//! reopens it except an explicit `reset`, which test suites use between cases.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

// =============================================================================
// EVENT NAMES
// =============================================================================

/// Published after a layout save succeeds. Payload: `{ "name", "stationId" }`.
pub const CONFIG_UPDATED: &str = "config-updated";

/// Raw message received from the live ticket stream, forwarded verbatim.
pub const LIVE_EVENT: &str = "live-event";

/// Live stream connection state changes. Payload: `{ "state", "detail"? }`.
pub const LIVE_STATUS: &str = "live-status";

// =============================================================================
// TYPES
// =============================================================================

/// A transient named message. Never persisted, never retained past dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus is shut down")]
    Closed,
}

/// Error returned by a handler. Logged by the bus, never propagated.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Token identifying one registration. Pass it to [`EventBus::unsubscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
}

impl Subscription {
    #[must_use]
    pub fn id(self) -> u64 {
        self.id
    }
}

/// Outcome of a single `publish` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dispatch {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned `Err` or panicked.
    pub failed: usize,
}

type Handler = dyn Fn(&Event) -> HandlerResult + Send + Sync;

struct Registration {
    id: u64,
    active: AtomicBool,
    handler: Box<Handler>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    closed: bool,
    by_name: HashMap<String, Vec<Arc<Registration>>>,
    /// Registration id -> event name, for unsubscribe by token.
    names: HashMap<u64, String>,
}

impl Registry {
    fn clear(&mut self) {
        for registration in self.by_name.values().flatten() {
            registration.active.store(false, Ordering::Release);
        }
        self.by_name.clear();
        self.names.clear();
    }
}

// =============================================================================
// EVENT BUS
// =============================================================================

/// Process-wide publish/subscribe channel. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] after [`EventBus::shutdown`].
    pub fn subscribe<F>(&self, name: impl Into<String>, handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let name = name.into();
        let mut registry = self.lock();
        if registry.closed {
            return Err(BusError::Closed);
        }

        registry.next_id += 1;
        let id = registry.next_id;
        let registration = Arc::new(Registration { id, active: AtomicBool::new(true), handler: Box::new(handler) });
        registry.by_name.entry(name.clone()).or_default().push(registration);
        debug!(subscription = id, event = %name, "bus: subscribed");
        registry.names.insert(id, name);

        Ok(Subscription { id })
    }

    /// Remove one registration. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut registry = self.lock();
        let Some(name) = registry.names.remove(&subscription.id) else {
            return false;
        };

        let Some(list) = registry.by_name.get_mut(&name) else {
            return false;
        };
        let Some(pos) = list.iter().position(|r| r.id == subscription.id) else {
            return false;
        };
        let registration = list.remove(pos);
        registration.active.store(false, Ordering::Release);
        if list.is_empty() {
            registry.by_name.remove(&name);
        }

        debug!(subscription = subscription.id, event = %name, "bus: unsubscribed");
        true
    }

    /// Deliver `payload` to every handler registered for `name`, in
    /// registration order, on the calling task.
    pub fn publish(&self, name: &str, payload: Value) -> Dispatch {
        let snapshot = {
            let registry = self.lock();
            if registry.closed {
                debug!(event = %name, "bus: publish after shutdown ignored");
                return Dispatch::default();
            }
            registry.by_name.get(name).cloned().unwrap_or_default()
        };

        let event = Event { name: name.to_owned(), payload };
        let mut dispatch = Dispatch::default();

        for registration in snapshot {
            // EDGE: unsubscribed by an earlier handler in this same publish.
            if !registration.active.load(Ordering::Acquire) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| (registration.handler)(&event))) {
                Ok(Ok(())) => dispatch.delivered += 1,
                Ok(Err(err)) => {
                    dispatch.failed += 1;
                    error!(event = %name, subscription = registration.id, error = %err, "bus: handler failed");
                }
                Err(cause) => {
                    dispatch.failed += 1;
                    error!(
                        event = %name,
                        subscription = registration.id,
                        cause = %panic_message(cause.as_ref()),
                        "bus: handler panicked"
                    );
                }
            }
        }

        dispatch
    }

    /// Number of live registrations for `name`.
    #[must_use]
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.lock().by_name.get(name).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Clear all subscriptions and close the bus.
    pub fn shutdown(&self) {
        let mut registry = self.lock();
        let count = registry.names.len();
        registry.clear();
        registry.closed = true;
        debug!(cleared = count, "bus: shut down");
    }

    /// Clear all subscriptions and reopen the bus.
    pub fn reset(&self) {
        let mut registry = self.lock();
        registry.clear();
        registry.closed = false;
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Handlers never run under this lock, so poisoning carries no torn state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
