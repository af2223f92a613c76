//! The dependency-injection handler.
//!
//! One handler per requirement field: [`SimpleDependency`] binds a single
//! service, [`AggregateDependency`] binds every matching one. Each handler
//! is a service listener on the host registry scoped to its required
//! specification; arrivals bind, departures unbind, and property changes
//! re-evaluate the requirement filter.
//!
//! With `immediate_rebind`, the departure of a bound service swaps in a
//! matching replacement *before* the unbind notification, so the instance
//! never leaves the VALID state over the hand-over.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use braze_core::{
    BundleContext, ServiceArc, ServiceEvent, ServiceEventKind, ServiceListener, ServiceReference,
};

use crate::component::ComponentObject;
use crate::context::{ComponentContext, Requirement};
use crate::handler::{Handler, HandlerFactory, HandlerKind, LifecycleVote};
use crate::instance::StoredInstance;

/// Produces one dependency handler per declared requirement.
pub struct RequiresHandlerFactory;

impl HandlerFactory for RequiresHandlerFactory {
    fn get_handlers(
        &self,
        context: &Arc<ComponentContext>,
        _component: &ComponentObject,
    ) -> Vec<Arc<dyn Handler>> {
        context
            .factory_context()
            .requirements()
            .iter()
            .map(|(field, requirement)| {
                if requirement.aggregate {
                    AggregateDependency::create(field.clone(), requirement.clone(), context.clone())
                } else {
                    SimpleDependency::create(field.clone(), requirement.clone(), context.clone())
                }
            })
            .collect()
    }
}

fn bundle_context(context: &ComponentContext) -> Option<Arc<dyn BundleContext>> {
    context.factory_context().bundle_context()
}

// ─── SimpleDependency ─────────────────────────────────────────────────────────

/// Binds the first matching service; invalid while unbound unless the
/// requirement is optional.
struct SimpleDependency {
    field: String,
    requirement: Requirement,
    context: Arc<ComponentContext>,
    instance: Mutex<Weak<StoredInstance>>,
    binding: Mutex<Option<(ServiceArc, ServiceReference)>>,
    this: Weak<SimpleDependency>,
}

impl SimpleDependency {
    fn create(
        field: String,
        requirement: Requirement,
        context: Arc<ComponentContext>,
    ) -> Arc<dyn Handler> {
        Arc::new_cyclic(|this| Self {
            field,
            requirement,
            context,
            instance: Mutex::new(Weak::new()),
            binding: Mutex::new(None),
            this: this.clone(),
        })
    }

    fn stored(&self) -> Option<Arc<StoredInstance>> {
        self.instance.lock().upgrade()
    }

    /// Finds, fetches, and records the first matching service.
    fn lookup_candidate(&self) -> Option<(ServiceArc, ServiceReference)> {
        let context = bundle_context(&self.context)?;
        for reference in context.get_all_service_references(&self.requirement.specification) {
            if self.requirement.matches(&reference)
                && let Some(service) = context.get_service(&reference)
            {
                return Some((service, reference));
            }
        }
        None
    }

    fn bind_candidate(&self, service: ServiceArc, reference: ServiceReference) {
        *self.binding.lock() = Some((service.clone(), reference.clone()));
        debug!(field = %self.field, service = reference.id(), "Dependency bound");
        if let Some(stored) = self.stored() {
            stored.bind(self, &service, &reference);
        }
    }

    fn on_arrival(&self, reference: &ServiceReference) {
        if self.binding.lock().is_some() || !self.requirement.matches(reference) {
            return;
        }
        let Some(context) = bundle_context(&self.context) else {
            return;
        };
        if let Some(service) = context.get_service(reference) {
            self.bind_candidate(service, reference.clone());
        }
    }

    fn on_departure(&self, reference: &ServiceReference) {
        let bound = {
            let binding = self.binding.lock();
            binding
                .as_ref()
                .filter(|(_, bound_ref)| bound_ref == reference)
                .cloned()
        };
        let Some((service, bound_ref)) = bound else {
            return;
        };

        let replacement = if self.requirement.immediate_rebind {
            self.lookup_candidate()
        } else {
            None
        };

        match replacement {
            Some((new_service, new_reference)) => {
                // Swap before notifying: the instance stays valid across
                // the hand-over.
                *self.binding.lock() = Some((new_service.clone(), new_reference.clone()));
                debug!(
                    field = %self.field,
                    old = bound_ref.id(),
                    new = new_reference.id(),
                    "Dependency rebound"
                );
                if let Some(stored) = self.stored() {
                    stored.unbind(self, &service, &bound_ref);
                    stored.bind(self, &new_service, &new_reference);
                }
            }
            None => {
                *self.binding.lock() = None;
                debug!(field = %self.field, service = bound_ref.id(), "Dependency unbound");
                if let Some(stored) = self.stored() {
                    stored.unbind(self, &service, &bound_ref);
                }
            }
        }
        if let Some(context) = bundle_context(&self.context) {
            context.unget_service(&bound_ref);
        }
    }

    fn on_modified(&self, reference: &ServiceReference) {
        let bound_here = {
            let binding = self.binding.lock();
            binding
                .as_ref()
                .filter(|(_, bound_ref)| bound_ref == reference)
                .cloned()
        };
        match bound_here {
            Some((service, bound_ref)) => {
                if self.requirement.matches(reference) {
                    if let Some(stored) = self.stored() {
                        stored.update(self, &service, &bound_ref);
                    }
                } else {
                    // The bound service no longer matches the filter.
                    self.on_departure(reference);
                }
            }
            None => self.on_arrival(reference),
        }
    }
}

impl Handler for SimpleDependency {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Dependency
    }

    fn name(&self) -> &'static str {
        "SimpleDependency"
    }

    fn manipulate(&self, instance: &Arc<StoredInstance>) {
        *self.instance.lock() = Arc::downgrade(instance);
    }

    fn start(&self) {
        if let (Some(context), Some(me)) = (bundle_context(&self.context), self.this.upgrade()) {
            context.add_service_listener(me, Some(self.requirement.specification.as_str()), None);
        }
    }

    fn stop(&self) {
        if let (Some(context), Some(me)) = (bundle_context(&self.context), self.this.upgrade()) {
            let listener: Arc<dyn ServiceListener> = me;
            context.remove_service_listener(&listener);
        }
    }

    fn clear(&self) {
        *self.binding.lock() = None;
        *self.instance.lock() = Weak::new();
    }

    fn check_lifecycle(&self) -> LifecycleVote {
        if self.requirement.optional || self.binding.lock().is_some() {
            LifecycleVote::Valid
        } else {
            LifecycleVote::Invalid
        }
    }

    fn update_bindings(&self) {
        if self.binding.lock().is_some() {
            return;
        }
        if let Some((service, reference)) = self.lookup_candidate() {
            self.bind_candidate(service, reference);
        }
    }

    fn bindings(&self) -> Vec<ServiceReference> {
        self.binding
            .lock()
            .as_ref()
            .map(|(_, reference)| vec![reference.clone()])
            .unwrap_or_default()
    }

    fn field(&self) -> Option<String> {
        Some(self.field.clone())
    }

    fn requirement(&self) -> Option<Requirement> {
        Some(self.requirement.clone())
    }
}

impl ServiceListener for SimpleDependency {
    fn service_changed(&self, event: &ServiceEvent) {
        match event.kind {
            ServiceEventKind::Registered => self.on_arrival(&event.reference),
            ServiceEventKind::Unregistering => self.on_departure(&event.reference),
            ServiceEventKind::Modified => self.on_modified(&event.reference),
        }
    }
}

// ─── AggregateDependency ──────────────────────────────────────────────────────

/// Binds every matching service; invalid while empty unless the
/// requirement is optional.
struct AggregateDependency {
    field: String,
    requirement: Requirement,
    context: Arc<ComponentContext>,
    instance: Mutex<Weak<StoredInstance>>,
    bindings: Mutex<Vec<(ServiceArc, ServiceReference)>>,
    this: Weak<AggregateDependency>,
}

impl AggregateDependency {
    fn create(
        field: String,
        requirement: Requirement,
        context: Arc<ComponentContext>,
    ) -> Arc<dyn Handler> {
        Arc::new_cyclic(|this| Self {
            field,
            requirement,
            context,
            instance: Mutex::new(Weak::new()),
            bindings: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    fn stored(&self) -> Option<Arc<StoredInstance>> {
        self.instance.lock().upgrade()
    }

    fn is_bound(&self, reference: &ServiceReference) -> bool {
        self.bindings
            .lock()
            .iter()
            .any(|(_, bound)| bound == reference)
    }

    fn on_arrival(&self, reference: &ServiceReference) {
        if self.is_bound(reference) || !self.requirement.matches(reference) {
            return;
        }
        let Some(context) = bundle_context(&self.context) else {
            return;
        };
        if let Some(service) = context.get_service(reference) {
            self.bindings
                .lock()
                .push((service.clone(), reference.clone()));
            debug!(field = %self.field, service = reference.id(), "Dependency bound");
            if let Some(stored) = self.stored() {
                stored.bind(self, &service, reference);
            }
        }
    }

    fn on_departure(&self, reference: &ServiceReference) {
        let removed = {
            let mut bindings = self.bindings.lock();
            let index = bindings.iter().position(|(_, bound)| bound == reference);
            index.map(|i| bindings.remove(i))
        };
        if let Some((service, bound_ref)) = removed {
            debug!(field = %self.field, service = bound_ref.id(), "Dependency unbound");
            if let Some(stored) = self.stored() {
                stored.unbind(self, &service, &bound_ref);
            }
            if let Some(context) = bundle_context(&self.context) {
                context.unget_service(&bound_ref);
            }
        }
    }

    fn on_modified(&self, reference: &ServiceReference) {
        if self.is_bound(reference) {
            if self.requirement.matches(reference) {
                let bound = {
                    let bindings = self.bindings.lock();
                    bindings
                        .iter()
                        .find(|(_, bound)| bound == reference)
                        .cloned()
                };
                if let Some((service, bound_ref)) = bound
                    && let Some(stored) = self.stored()
                {
                    stored.update(self, &service, &bound_ref);
                }
            } else {
                self.on_departure(reference);
            }
        } else {
            self.on_arrival(reference);
        }
    }
}

impl Handler for AggregateDependency {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Dependency
    }

    fn name(&self) -> &'static str {
        "AggregateDependency"
    }

    fn manipulate(&self, instance: &Arc<StoredInstance>) {
        *self.instance.lock() = Arc::downgrade(instance);
    }

    fn start(&self) {
        if let (Some(context), Some(me)) = (bundle_context(&self.context), self.this.upgrade()) {
            context.add_service_listener(me, Some(self.requirement.specification.as_str()), None);
        }
    }

    fn stop(&self) {
        if let (Some(context), Some(me)) = (bundle_context(&self.context), self.this.upgrade()) {
            let listener: Arc<dyn ServiceListener> = me;
            context.remove_service_listener(&listener);
        }
    }

    fn clear(&self) {
        self.bindings.lock().clear();
        *self.instance.lock() = Weak::new();
    }

    fn check_lifecycle(&self) -> LifecycleVote {
        if self.requirement.optional || !self.bindings.lock().is_empty() {
            LifecycleVote::Valid
        } else {
            LifecycleVote::Invalid
        }
    }

    fn update_bindings(&self) {
        let Some(context) = bundle_context(&self.context) else {
            return;
        };
        for reference in context.get_all_service_references(&self.requirement.specification) {
            if !self.is_bound(&reference) && self.requirement.matches(&reference) {
                if let Some(service) = context.get_service(&reference) {
                    self.bindings
                        .lock()
                        .push((service.clone(), reference.clone()));
                    if let Some(stored) = self.stored() {
                        stored.bind(self, &service, &reference);
                    }
                }
            }
        }
    }

    fn bindings(&self) -> Vec<ServiceReference> {
        self.bindings
            .lock()
            .iter()
            .map(|(_, reference)| reference.clone())
            .collect()
    }

    fn field(&self) -> Option<String> {
        Some(self.field.clone())
    }

    fn requirement(&self) -> Option<Requirement> {
        Some(self.requirement.clone())
    }
}

impl ServiceListener for AggregateDependency {
    fn service_changed(&self, event: &ServiceEvent) {
        match event.kind {
            ServiceEventKind::Registered => self.on_arrival(&event.reference),
            ServiceEventKind::Unregistering => self.on_departure(&event.reference),
            ServiceEventKind::Modified => self.on_modified(&event.reference),
        }
    }
}
