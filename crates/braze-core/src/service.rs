//! Service registry contracts: references, registrations, and change events.
//!
//! The registry itself lives outside this crate; these are the handles and
//! listener interfaces through which the component runtime observes it.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::filter::Filter;
use crate::properties::Properties;

/// Type-erased service object, as stored in the registry.
pub type ServiceArc = Arc<dyn Any + Send + Sync>;

// ─── ServiceReference ─────────────────────────────────────────────────────────

struct ReferenceInner {
    id: u64,
    specifications: Vec<String>,
    properties: Mutex<Properties>,
    usage: AtomicUsize,
}

/// A cheap-clone handle to one registered service.
///
/// Identity (`Eq`, `Hash`, `Ord`) is the numeric service id, so references
/// obtained at different times for the same registration compare equal.
#[derive(Clone)]
pub struct ServiceReference {
    inner: Arc<ReferenceInner>,
}

impl ServiceReference {
    /// Creates a reference. Called by registry implementations only.
    pub fn new(id: u64, specifications: Vec<String>, properties: Properties) -> Self {
        Self {
            inner: Arc::new(ReferenceInner {
                id,
                specifications,
                properties: Mutex::new(properties),
                usage: AtomicUsize::new(0),
            }),
        }
    }

    /// Numeric service id, unique per registry.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Specifications this service was registered under.
    pub fn specifications(&self) -> &[String] {
        &self.inner.specifications
    }

    /// Whether the service was registered under `specification`.
    pub fn provides(&self, specification: &str) -> bool {
        self.inner.specifications.iter().any(|s| s == specification)
    }

    /// Returns one property value, cloned.
    pub fn get_property(&self, key: &str) -> Option<Value> {
        self.inner.properties.lock().get(key).cloned()
    }

    /// Snapshot of all properties.
    pub fn properties(&self) -> Properties {
        self.inner.properties.lock().clone()
    }

    /// Replaces the property map, returning the previous one. Called by
    /// registry implementations when the owner updates its registration.
    pub fn replace_properties(&self, properties: Properties) -> Properties {
        std::mem::replace(&mut *self.inner.properties.lock(), properties)
    }

    /// Whether the reference satisfies the filter (an absent filter matches).
    pub fn matches(&self, filter: Option<&Filter>) -> bool {
        match filter {
            Some(f) => f.matches(&self.inner.properties.lock()),
            None => true,
        }
    }

    /// Records one consumer acquisition.
    pub fn acquire(&self) {
        self.inner.usage.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one consumer release.
    pub fn release(&self) {
        let _ = self
            .inner
            .usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Number of outstanding acquisitions.
    pub fn usage_count(&self) -> usize {
        self.inner.usage.load(Ordering::Relaxed)
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ServiceReference {}

impl Hash for ServiceReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl PartialOrd for ServiceReference {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceReference {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner.id.cmp(&other.inner.id)
    }
}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceReference")
            .field("id", &self.inner.id)
            .field("specifications", &self.inner.specifications)
            .finish()
    }
}

// ─── ServiceRegistration ──────────────────────────────────────────────────────

/// Write-side of a registry, seen from a registration handle.
///
/// Implemented by registry hosts; registrations hold it weakly so a dropped
/// registry turns the handle into a no-op.
pub trait Registrar: Send + Sync {
    /// Removes the service from the registry, firing UNREGISTERING.
    fn unregister(&self, reference: &ServiceReference);
    /// Replaces the service properties, firing MODIFIED.
    fn update_properties(&self, reference: &ServiceReference, properties: Properties);
}

struct RegistrationInner {
    reference: ServiceReference,
    registrar: Weak<dyn Registrar>,
    active: Mutex<bool>,
}

/// Owner handle for one registered service.
#[derive(Clone)]
pub struct ServiceRegistration {
    inner: Arc<RegistrationInner>,
}

impl ServiceRegistration {
    /// Creates a registration handle. Called by registry implementations only.
    pub fn new(reference: ServiceReference, registrar: Weak<dyn Registrar>) -> Self {
        Self {
            inner: Arc::new(RegistrationInner {
                reference,
                registrar,
                active: Mutex::new(true),
            }),
        }
    }

    /// The reference identifying the registered service.
    pub fn reference(&self) -> &ServiceReference {
        &self.inner.reference
    }

    /// Replaces the service properties; consumers observe a MODIFIED event.
    pub fn set_properties(&self, properties: Properties) {
        if !*self.inner.active.lock() {
            return;
        }
        if let Some(registrar) = self.inner.registrar.upgrade() {
            registrar.update_properties(&self.inner.reference, properties);
        }
    }

    /// Withdraws the service. Returns `false` when already unregistered.
    pub fn unregister(&self) -> bool {
        {
            let mut active = self.inner.active.lock();
            if !*active {
                return false;
            }
            *active = false;
        }
        if let Some(registrar) = self.inner.registrar.upgrade() {
            registrar.unregister(&self.inner.reference);
        }
        true
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("reference", &self.inner.reference)
            .field("active", &*self.inner.active.lock())
            .finish()
    }
}

// ─── Service events ───────────────────────────────────────────────────────────

/// Kind of change observed on a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceEventKind {
    /// The service just entered the registry.
    Registered,
    /// The service properties changed.
    Modified,
    /// The service is leaving the registry.
    Unregistering,
}

/// A service change notification.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    /// What happened.
    pub kind: ServiceEventKind,
    /// The affected service.
    pub reference: ServiceReference,
    /// Previous properties, for [`ServiceEventKind::Modified`] events.
    pub previous_properties: Option<Properties>,
}

/// Receives service change notifications, synchronously, on the thread that
/// triggered the change.
pub trait ServiceListener: Send + Sync {
    /// Called for every matching service event.
    fn service_changed(&self, event: &ServiceEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reference_identity_is_the_id() {
        let a = ServiceReference::new(7, vec!["spec.a".into()], Properties::new());
        let b = ServiceReference::new(7, vec!["spec.b".into()], Properties::new());
        let c = ServiceReference::new(8, vec!["spec.a".into()], Properties::new());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
    }

    #[test]
    fn reference_properties_and_usage() {
        let props = Properties::from([("rank".to_string(), json!(3))]);
        let reference = ServiceReference::new(1, vec!["spec".into()], props);

        assert!(reference.provides("spec"));
        assert!(!reference.provides("other"));
        assert_eq!(reference.get_property("rank"), Some(json!(3)));
        assert!(reference.matches(Some(&Filter::eq("rank", 3))));
        assert!(!reference.matches(Some(&Filter::eq("rank", 4))));

        reference.acquire();
        reference.acquire();
        reference.release();
        assert_eq!(reference.usage_count(), 1);
        reference.release();
        reference.release();
        assert_eq!(reference.usage_count(), 0);
    }
}
