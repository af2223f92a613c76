//! Runtime lifecycle events and their fan-out to listeners.
//!
//! Delivery is synchronous on the thread that produced the event. The
//! listener list is copied before delivery, so a listener may add or remove
//! listeners without affecting the current round, and a failing listener
//! never prevents delivery to the ones after it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;

use braze_core::{BoxError, identity_eq};

/// Kind of a runtime lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuntimeEventKind {
    /// A factory entered the registry.
    Registered,
    /// A factory left the registry.
    Unregistered,
    /// An instance was created and its handlers resolved.
    Instantiated,
    /// An instance reached the VALID state.
    Validated,
    /// An instance left the VALID state (or failed validation).
    Invalidated,
    /// A dependency of an instance was bound.
    Bound,
    /// A dependency of an instance was unbound.
    Unbound,
    /// An instance reached its terminal state.
    Killed,
}

/// A runtime lifecycle event: the kind, the factory involved, and — for
/// instance-level events — the instance name.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    /// What happened.
    pub kind: RuntimeEventKind,
    /// The factory the event relates to.
    pub factory: String,
    /// The instance the event relates to, for instance-level events.
    pub instance: Option<String>,
}

impl RuntimeEvent {
    /// A factory-level event (REGISTERED / UNREGISTERED).
    pub fn factory(kind: RuntimeEventKind, factory: impl Into<String>) -> Self {
        Self {
            kind,
            factory: factory.into(),
            instance: None,
        }
    }

    /// An instance-level event.
    pub fn instance(
        kind: RuntimeEventKind,
        factory: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            factory: factory.into(),
            instance: Some(instance.into()),
        }
    }
}

/// Receives runtime lifecycle events.
///
/// Listeners are called synchronously on the event-producing thread and
/// must not block the runtime. A returned error is logged and swallowed.
pub trait RuntimeListener: Send + Sync {
    /// Called for every runtime event.
    fn handle_event(&self, event: &RuntimeEvent) -> Result<(), BoxError>;
}

/// The listener registry with copy-on-fire delivery.
pub struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn RuntimeListener>>>,
}

impl ListenerSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Adds a listener. Returns `false` when it was already present.
    pub fn add(&self, listener: Arc<dyn RuntimeListener>) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|l| identity_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Removes a listener by identity. Returns `false` when it was absent.
    pub fn remove(&self, listener: &Arc<dyn RuntimeListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !identity_eq(l, listener));
        listeners.len() != before
    }

    /// Delivers `event` to every listener registered at call time.
    pub fn fire(&self, event: &RuntimeEvent) {
        let snapshot = self.listeners.lock().clone();
        for listener in snapshot {
            if let Err(e) = listener.handle_event(event) {
                error!(
                    kind = ?event.kind,
                    factory = %event.factory,
                    error = %e,
                    "Error calling a runtime event listener"
                );
            }
        }
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}
