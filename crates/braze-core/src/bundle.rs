//! Bundle contracts: the loadable code units owning component factories.
//!
//! A [`Bundle`] is a cheap-clone handle managed by the framework. Instead of
//! reflective module scanning, a bundle carries an explicit *contribution*
//! list: type-erased values its author attaches at install time. Consumers
//! (such as the component runtime) downcast the contributions they recognise
//! when the bundle starts.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::context::BundleContext;
use crate::service::ServiceArc;

/// Lifecycle state of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BundleState {
    /// Installed but not started.
    Installed,
    /// Started; its contributions are live.
    Active,
    /// Being stopped.
    Stopping,
    /// Removed from the framework.
    Uninstalled,
}

struct BundleInner {
    id: u64,
    name: String,
    state: Mutex<BundleState>,
    contributions: Mutex<Vec<ServiceArc>>,
    context: Mutex<Option<Weak<dyn BundleContext>>>,
}

/// A cheap-clone handle to one bundle. Identity is the numeric bundle id.
#[derive(Clone)]
pub struct Bundle {
    inner: Arc<BundleInner>,
}

impl Bundle {
    /// Creates a bundle handle. Called by framework implementations only.
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BundleInner {
                id,
                name: name.into(),
                state: Mutex::new(BundleState::Installed),
                contributions: Mutex::new(Vec::new()),
                context: Mutex::new(None),
            }),
        }
    }

    /// Numeric bundle id; 0 is the framework bundle.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Symbolic name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BundleState {
        *self.inner.state.lock()
    }

    /// Updates the lifecycle state. Called by framework implementations only.
    pub fn set_state(&self, state: BundleState) {
        *self.inner.state.lock() = state;
    }

    /// Attaches a contribution, e.g. a component factory.
    pub fn contribute(&self, contribution: ServiceArc) {
        self.inner.contributions.lock().push(contribution);
    }

    /// Snapshot of the contribution list, in attachment order.
    pub fn contributions(&self) -> Vec<ServiceArc> {
        self.inner.contributions.lock().clone()
    }

    /// Wires the bundle to its context. Called by framework implementations;
    /// the pointer is weak so the context keeps no cycle through the bundle.
    pub fn attach_context(&self, context: Weak<dyn BundleContext>) {
        *self.inner.context.lock() = Some(context);
    }

    /// The bundle's context, if the framework still holds it.
    pub fn context(&self) -> Option<Arc<dyn BundleContext>> {
        self.inner.context.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl PartialEq for Bundle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Bundle {}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

// ─── Bundle events ────────────────────────────────────────────────────────────

/// Kind of bundle lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BundleEventKind {
    /// The bundle is starting; fired before its own activation logic runs.
    Starting,
    /// The bundle is stopping; fired after its own deactivation logic ran.
    StoppingPreclean,
    /// An update begins; the old revision is still live.
    UpdateBegin,
    /// The update finished; the new revision is live.
    Updated,
    /// The update failed; the bundle stays on the old revision.
    UpdateFailed,
}

/// A bundle lifecycle notification.
#[derive(Debug, Clone)]
pub struct BundleEvent {
    /// What happened.
    pub kind: BundleEventKind,
    /// The affected bundle.
    pub bundle: Bundle,
}

/// Receives bundle lifecycle notifications, synchronously.
pub trait BundleListener: Send + Sync {
    /// Called for every bundle event.
    fn bundle_changed(&self, event: &BundleEvent);
}

/// Notified once when the framework is about to stop.
pub trait FrameworkStopListener: Send + Sync {
    /// Called on the thread that stops the framework.
    fn framework_stopping(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_identity_and_state() {
        let a = Bundle::new(1, "bundle.a");
        let b = a.clone();
        let c = Bundle::new(2, "bundle.a");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.state(), BundleState::Installed);
        a.set_state(BundleState::Active);
        assert_eq!(b.state(), BundleState::Active);
    }

    #[test]
    fn contributions_keep_order() {
        let bundle = Bundle::new(1, "bundle.a");
        bundle.contribute(Arc::new("first".to_string()));
        bundle.contribute(Arc::new(2u32));

        let contributions = bundle.contributions();
        assert_eq!(contributions.len(), 2);
        assert_eq!(
            contributions[0].downcast_ref::<String>().map(String::as_str),
            Some("first")
        );
        assert_eq!(contributions[1].downcast_ref::<u32>(), Some(&2));
    }
}
