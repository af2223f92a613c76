//! The in-memory service registry.
//!
//! Holds `(reference, service)` pairs and dispatches change events to
//! registered listeners. Dispatch is synchronous on the mutating thread and
//! always happens **after** the registry lock is released — listeners
//! routinely re-enter the registry (a dependency handler reacting to an
//! UNREGISTERING event immediately looks up a replacement).
//!
//! Departure ordering: the service is removed from the lookup tables first,
//! *then* UNREGISTERING is dispatched. A listener searching the registry
//! during the event therefore never finds the dying service again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use braze_core::{
    CoreError, CoreResult, Filter, Properties, Registrar, SERVICE_ID, ServiceArc, ServiceEvent,
    ServiceEventKind, ServiceListener, ServiceReference, ServiceRegistration, identity_eq,
};

struct ListenerEntry {
    listener: Arc<dyn ServiceListener>,
    specification: Option<String>,
    filter: Option<Filter>,
}

#[derive(Default)]
struct RegistryState {
    services: BTreeMap<u64, (ServiceReference, ServiceArc)>,
    listeners: Vec<ListenerEntry>,
}

/// An in-memory `(reference, service, properties)` store with synchronous
/// listener dispatch.
pub struct ServiceRegistry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers `service` under the given specifications and returns the
    /// owner handle. The numeric service id is added to the properties under
    /// [`SERVICE_ID`].
    pub fn register(
        self: &Arc<Self>,
        specifications: &[&str],
        service: ServiceArc,
        mut properties: Properties,
    ) -> CoreResult<ServiceRegistration> {
        if specifications.is_empty() {
            return Err(CoreError::EmptySpecifications);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        properties.insert(SERVICE_ID.to_string(), Value::from(id));
        let reference = ServiceReference::new(
            id,
            specifications.iter().map(|s| s.to_string()).collect(),
            properties,
        );

        let recipients = {
            let mut state = self.state.lock();
            state.services.insert(id, (reference.clone(), service));
            matching_listeners(&state, &reference)
        };
        debug!(service = id, specifications = ?specifications, "Service registered");
        dispatch(
            recipients,
            &ServiceEvent {
                kind: ServiceEventKind::Registered,
                reference: reference.clone(),
                previous_properties: None,
            },
        );

        let registrar: Arc<dyn Registrar> = self.clone();
        Ok(ServiceRegistration::new(reference, Arc::downgrade(&registrar)))
    }

    /// Fetches the service object behind `reference`, recording the usage.
    pub fn get_service(&self, reference: &ServiceReference) -> Option<ServiceArc> {
        let service = {
            let state = self.state.lock();
            state.services.get(&reference.id()).map(|(_, s)| s.clone())
        };
        if service.is_some() {
            reference.acquire();
        }
        service
    }

    /// Releases one usage of the service.
    pub fn unget_service(&self, reference: &ServiceReference) {
        reference.release();
    }

    /// Returns the matching reference with the lowest service id.
    pub fn get_reference(
        &self,
        specification: &str,
        filter: Option<&Filter>,
    ) -> Option<ServiceReference> {
        let state = self.state.lock();
        state
            .services
            .values()
            .map(|(reference, _)| reference)
            .find(|r| r.provides(specification) && r.matches(filter))
            .cloned()
    }

    /// Returns every reference registered under `specification`, ordered by
    /// ascending service id.
    pub fn get_references(&self, specification: &str) -> Vec<ServiceReference> {
        let state = self.state.lock();
        state
            .services
            .values()
            .map(|(reference, _)| reference)
            .filter(|r| r.provides(specification))
            .cloned()
            .collect()
    }

    /// Subscribes a listener, optionally scoped to one specification and to
    /// references whose properties match `filter`. Adding the same listener
    /// twice is a no-op.
    pub fn add_listener(
        &self,
        listener: Arc<dyn ServiceListener>,
        specification: Option<&str>,
        filter: Option<Filter>,
    ) {
        let mut state = self.state.lock();
        if state
            .listeners
            .iter()
            .any(|e| identity_eq(&e.listener, &listener))
        {
            return;
        }
        state.listeners.push(ListenerEntry {
            listener,
            specification: specification.map(str::to_string),
            filter,
        });
    }

    /// Unsubscribes a listener, matched by identity.
    pub fn remove_listener(&self, listener: &Arc<dyn ServiceListener>) {
        let mut state = self.state.lock();
        state.listeners.retain(|e| !identity_eq(&e.listener, listener));
    }
}

impl Registrar for ServiceRegistry {
    fn unregister(&self, reference: &ServiceReference) {
        let recipients = {
            let mut state = self.state.lock();
            if state.services.remove(&reference.id()).is_none() {
                return;
            }
            matching_listeners(&state, reference)
        };
        debug!(service = reference.id(), "Service unregistering");
        dispatch(
            recipients,
            &ServiceEvent {
                kind: ServiceEventKind::Unregistering,
                reference: reference.clone(),
                previous_properties: None,
            },
        );
    }

    fn update_properties(&self, reference: &ServiceReference, mut properties: Properties) {
        properties.insert(SERVICE_ID.to_string(), Value::from(reference.id()));
        let previous = reference.replace_properties(properties);
        let recipients = {
            let state = self.state.lock();
            if !state.services.contains_key(&reference.id()) {
                return;
            }
            matching_listeners(&state, reference)
        };
        dispatch(
            recipients,
            &ServiceEvent {
                kind: ServiceEventKind::Modified,
                reference: reference.clone(),
                previous_properties: Some(previous),
            },
        );
    }
}

fn matching_listeners(
    state: &RegistryState,
    reference: &ServiceReference,
) -> Vec<Arc<dyn ServiceListener>> {
    state
        .listeners
        .iter()
        .filter(|entry| {
            entry
                .specification
                .as_deref()
                .is_none_or(|spec| reference.provides(spec))
                && reference.matches(entry.filter.as_ref())
        })
        .map(|entry| entry.listener.clone())
        .collect()
}

fn dispatch(recipients: Vec<Arc<dyn ServiceListener>>, event: &ServiceEvent) {
    for listener in recipients {
        listener.service_changed(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct Recorder {
        events: PlMutex<Vec<(ServiceEventKind, u64)>>,
    }

    impl ServiceListener for Recorder {
        fn service_changed(&self, event: &ServiceEvent) {
            self.events.lock().push((event.kind, event.reference.id()));
        }
    }

    fn register_str(
        registry: &Arc<ServiceRegistry>,
        spec: &str,
        value: &str,
    ) -> ServiceRegistration {
        registry
            .register(&[spec], Arc::new(value.to_string()), Properties::new())
            .expect("registration")
    }

    #[test]
    fn register_lookup_and_get() {
        let registry = ServiceRegistry::new();
        let registration = register_str(&registry, "spec.echo", "hello");

        let reference = registry.get_reference("spec.echo", None).expect("reference");
        assert_eq!(reference, *registration.reference());
        assert_eq!(
            reference.get_property(SERVICE_ID),
            Some(Value::from(reference.id()))
        );

        let service = registry.get_service(&reference).expect("service");
        assert_eq!(service.downcast_ref::<String>().map(String::as_str), Some("hello"));
        assert_eq!(reference.usage_count(), 1);
        registry.unget_service(&reference);
        assert_eq!(reference.usage_count(), 0);
    }

    #[test]
    fn lowest_id_wins_and_all_references_ordered() {
        let registry = ServiceRegistry::new();
        let first = register_str(&registry, "spec.echo", "a");
        let _second = register_str(&registry, "spec.echo", "b");

        let best = registry.get_reference("spec.echo", None).expect("reference");
        assert_eq!(best, *first.reference());

        let all = registry.get_references("spec.echo");
        assert_eq!(all.len(), 2);
        assert!(all[0] < all[1]);
    }

    #[test]
    fn filtered_lookup() {
        let registry = ServiceRegistry::new();
        let mut props = Properties::new();
        props.insert("lang".to_string(), Value::from("fr"));
        registry
            .register(&["spec.echo"], Arc::new(1u32), props)
            .expect("registration");

        assert!(
            registry
                .get_reference("spec.echo", Some(&Filter::eq("lang", "fr")))
                .is_some()
        );
        assert!(
            registry
                .get_reference("spec.echo", Some(&Filter::eq("lang", "en")))
                .is_none()
        );
    }

    #[test]
    fn listeners_observe_lifecycle_in_order() {
        let registry = ServiceRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.add_listener(recorder.clone(), Some("spec.echo"), None);

        let registration = register_str(&registry, "spec.echo", "x");
        register_str(&registry, "spec.other", "ignored");
        registration.set_properties(Properties::new());
        registration.unregister();
        assert!(!registration.unregister());

        let id = registration.reference().id();
        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                (ServiceEventKind::Registered, id),
                (ServiceEventKind::Modified, id),
                (ServiceEventKind::Unregistering, id),
            ]
        );
    }

    #[test]
    fn dying_service_is_unfindable_during_unregistering() {
        struct Prober {
            registry: Arc<ServiceRegistry>,
            saw_replacement: PlMutex<Option<bool>>,
        }
        impl ServiceListener for Prober {
            fn service_changed(&self, event: &ServiceEvent) {
                if event.kind == ServiceEventKind::Unregistering {
                    let found = self.registry.get_reference("spec.echo", None).is_some();
                    *self.saw_replacement.lock() = Some(found);
                }
            }
        }

        let registry = ServiceRegistry::new();
        let prober = Arc::new(Prober {
            registry: registry.clone(),
            saw_replacement: PlMutex::new(None),
        });
        registry.add_listener(prober.clone(), Some("spec.echo"), None);

        let registration = register_str(&registry, "spec.echo", "x");
        registration.unregister();
        assert_eq!(*prober.saw_replacement.lock(), Some(false));
    }
}
