//! The stored instance: user object, handler set, and the lifecycle FSM.
//!
//! Every transition runs under a per-instance **re-entrant** lock: handlers
//! notified from within a transition call back into the instance (a
//! dependency handler binding during `update_bindings` calls
//! [`StoredInstance::bind`]) on the same thread. Mutable state lives in a
//! `RefCell` inside the lock; no borrow is ever held across a handler or
//! user callback, so re-entrant frames always find the cell free.
//!
//! Registry-level locks are never held here — user callbacks observe only
//! the instance lock.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use braze_core::{
    BoxError, Properties, ServiceArc, ServiceReference, render_error_trace,
};

use crate::component::{BindingCallback, ComponentObject, LifecycleCallback, RegistrationCallback};
use crate::context::ComponentContext;
use crate::events::{ListenerSet, RuntimeEvent, RuntimeEventKind};
use crate::handler::{Handler, HandlerKind, LifecycleVote};

/// Lifecycle state of a component instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    /// Not validated; dependencies may be missing.
    Invalid,
    /// Validated; provided services are registered.
    Valid,
    /// The validation callback failed; waits for an explicit retry.
    Erroneous,
    /// Terminal.
    Killed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InstanceState::Invalid => "INVALID",
            InstanceState::Valid => "VALID",
            InstanceState::Erroneous => "ERRONEOUS",
            InstanceState::Killed => "KILLED",
        };
        f.write_str(label)
    }
}

enum BindingEvent {
    Bind,
    Update,
    Unbind,
}

impl BindingEvent {
    fn label(&self) -> &'static str {
        match self {
            BindingEvent::Bind => "BIND",
            BindingEvent::Update => "UPDATE",
            BindingEvent::Unbind => "UNBIND",
        }
    }
}

struct InstanceInner {
    state: InstanceState,
    error_trace: Option<String>,
    component: Option<ComponentObject>,
    handlers: Vec<Arc<dyn Handler>>,
}

/// A live component instance held by the runtime.
pub struct StoredInstance {
    name: String,
    factory_name: String,
    context: Arc<ComponentContext>,
    events: Arc<ListenerSet>,
    inner: ReentrantMutex<RefCell<InstanceInner>>,
}

impl StoredInstance {
    /// Creates the stored instance in the INVALID state. The caller runs
    /// `manipulate` on every handler before starting it.
    pub fn new(
        context: Arc<ComponentContext>,
        component: ComponentObject,
        handlers: Vec<Arc<dyn Handler>>,
        events: Arc<ListenerSet>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: context.name().to_string(),
            factory_name: context.factory_context().name().to_string(),
            context,
            events,
            inner: ReentrantMutex::new(RefCell::new(InstanceInner {
                state: InstanceState::Invalid,
                error_trace: None,
                component: Some(component),
                handlers,
            })),
        })
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the factory that produced the instance.
    pub fn factory_name(&self) -> &str {
        &self.factory_name
    }

    /// The per-instance context.
    pub fn context(&self) -> &Arc<ComponentContext> {
        &self.context
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        let guard = self.inner.lock();
        let state = guard.borrow().state;
        state
    }

    /// The captured validation failure, while ERRONEOUS.
    pub fn error_trace(&self) -> Option<String> {
        let guard = self.inner.lock();
        let trace = guard.borrow().error_trace.clone();
        trace
    }

    /// The user object, until the instance is killed.
    pub fn component(&self) -> Option<ComponentObject> {
        let guard = self.inner.lock();
        let component = guard.borrow().component.clone();
        component
    }

    /// The instance's handlers, optionally filtered by kind.
    pub fn get_handlers(&self, kind: Option<HandlerKind>) -> Vec<Arc<dyn Handler>> {
        let guard = self.inner.lock();
        let handlers = guard.borrow().handlers.clone();
        match kind {
            Some(kind) => handlers.into_iter().filter(|h| h.kind() == kind).collect(),
            None => handlers,
        }
    }

    // ─── Transitions ─────────────────────────────────────────────────────────

    /// Starts every handler, then immediately attempts a lifecycle check.
    pub fn start(&self) {
        let _guard = self.inner.lock();
        for handler in self.get_handlers(None) {
            handler.start();
        }
        self.check_lifecycle();
    }

    /// Asks every dependency handler to bind what currently matches, then
    /// re-checks the lifecycle. No-op once killed.
    pub fn update_bindings(&self) {
        let _guard = self.inner.lock();
        if self.state() == InstanceState::Killed {
            return;
        }
        for handler in self.get_handlers(Some(HandlerKind::Dependency)) {
            handler.update_bindings();
        }
        self.check_lifecycle();
    }

    /// Combines the handler votes and moves between INVALID and VALID.
    ///
    /// The instance may validate iff no handler votes [`LifecycleVote::Invalid`];
    /// abstentions never block.
    pub fn check_lifecycle(&self) {
        let _guard = self.inner.lock();
        let (state, handlers) = self.snapshot();
        let vetoed = handlers
            .iter()
            .any(|h| h.check_lifecycle() == LifecycleVote::Invalid);
        match state {
            InstanceState::Invalid if !vetoed => self.validate(&handlers),
            InstanceState::Valid if vetoed => {
                self.invalidate(true);
            }
            _ => {}
        }
    }

    /// Leaves the VALID state: withdraws provided services, runs the
    /// INVALIDATE callback (unless `callback` is false), and emits
    /// INVALIDATED. Returns `false` when the instance was not VALID.
    pub fn invalidate(&self, callback: bool) -> bool {
        let _guard = self.inner.lock();
        let handlers = {
            let cell = self.inner.lock();
            let mut inner = cell.borrow_mut();
            if inner.state != InstanceState::Valid {
                return false;
            }
            inner.state = InstanceState::Invalid;
            inner.handlers.clone()
        };
        debug!(instance = %self.name, "Invalidating component");

        let callbacks = self.context.factory_context().callbacks().clone();

        // Service unregistration precedes the INVALIDATE callback.
        for handler in handlers.iter().filter(|h| h.kind() == HandlerKind::ServiceProvider) {
            if let Some(reference) = handler.service_reference()
                && let Some(cb) = &callbacks.post_unregistration
            {
                self.logged_registration_callback(cb, &reference, "POST_UNREGISTRATION");
            }
            handler.unregister_service();
        }

        if callback && let Some(cb) = &callbacks.invalidate {
            self.logged_lifecycle_callback(cb, "INVALIDATE");
        }

        for handler in &handlers {
            handler.on_invalidated();
        }
        self.fire(RuntimeEventKind::Invalidated);
        true
    }

    /// Clears the ERRONEOUS state, merges the property updates, and retries
    /// validation. A no-op returning the current state off ERRONEOUS.
    pub fn retry_erroneous(&self, properties_update: Option<&Properties>) -> InstanceState {
        let _guard = self.inner.lock();
        {
            let cell = self.inner.lock();
            let mut inner = cell.borrow_mut();
            if inner.state != InstanceState::Erroneous {
                return inner.state;
            }
            inner.error_trace = None;
            inner.state = InstanceState::Invalid;
        }
        if let Some(updates) = properties_update {
            self.context.update_properties(updates);
        }
        self.check_lifecycle();
        self.state()
    }

    /// Terminal transition: invalidates if needed, stops and clears every
    /// handler, drops the references, and emits KILLED exactly once.
    pub fn kill(&self) -> bool {
        let _guard = self.inner.lock();
        if self.state() == InstanceState::Killed {
            return false;
        }
        self.invalidate(true);

        let handlers = self.get_handlers(None);
        for handler in &handlers {
            handler.stop();
        }
        for handler in &handlers {
            handler.clear();
        }
        {
            let cell = self.inner.lock();
            let mut inner = cell.borrow_mut();
            inner.state = InstanceState::Killed;
            inner.handlers.clear();
            inner.component = None;
        }
        debug!(instance = %self.name, "Component killed");
        self.fire(RuntimeEventKind::Killed);
        true
    }

    // ─── Handler notifications ───────────────────────────────────────────────

    /// A dependency handler bound a service: runs the field and global BIND
    /// callbacks, emits BOUND, and re-checks the lifecycle.
    pub fn bind(&self, handler: &dyn Handler, service: &ServiceArc, reference: &ServiceReference) {
        let _guard = self.inner.lock();
        let state = self.state();
        if state == InstanceState::Killed {
            return;
        }
        self.notify_binding(handler, state, service, reference, BindingEvent::Bind);
        self.fire(RuntimeEventKind::Bound);
        self.check_lifecycle();
    }

    /// A bound service's properties changed: runs the field and global
    /// UPDATE callbacks.
    pub fn update(&self, handler: &dyn Handler, service: &ServiceArc, reference: &ServiceReference) {
        let _guard = self.inner.lock();
        let state = self.state();
        if state == InstanceState::Killed {
            return;
        }
        self.notify_binding(handler, state, service, reference, BindingEvent::Update);
    }

    /// A dependency handler lost a service: runs the field and global
    /// UNBIND callbacks, emits UNBOUND, and re-checks the lifecycle.
    pub fn unbind(&self, handler: &dyn Handler, service: &ServiceArc, reference: &ServiceReference) {
        let _guard = self.inner.lock();
        let state = self.state();
        if state == InstanceState::Killed {
            return;
        }
        self.notify_binding(handler, state, service, reference, BindingEvent::Unbind);
        self.fire(RuntimeEventKind::Unbound);
        self.check_lifecycle();
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    /// Consistent snapshot of the instance, per the instance-detail record.
    pub fn details(&self) -> InstanceDetails {
        let _guard = self.inner.lock();
        let (state, handlers) = self.snapshot();
        let error_trace = self.error_trace();

        let mut services = HashMap::new();
        for handler in handlers.iter().filter(|h| h.kind() == HandlerKind::ServiceProvider) {
            if let Some(reference) = handler.service_reference() {
                services.insert(reference.id(), reference);
            }
        }

        let mut dependencies = HashMap::new();
        for handler in handlers.iter().filter(|h| h.kind() == HandlerKind::Dependency) {
            let (Some(field), Some(requirement)) = (handler.field(), handler.requirement()) else {
                continue;
            };
            dependencies.insert(
                field,
                DependencyDetails {
                    handler: handler.name().to_string(),
                    specification: requirement.specification,
                    filter: requirement.filter.map(|f| f.to_string()),
                    optional: requirement.optional,
                    aggregate: requirement.aggregate,
                    bindings: handler.bindings(),
                },
            );
        }

        let properties = self
            .context
            .visible_properties()
            .into_iter()
            .map(|(key, value)| (key, stringify(&value)))
            .collect();

        InstanceDetails {
            name: self.name.clone(),
            factory: self.factory_name.clone(),
            bundle_id: self
                .context
                .factory_context()
                .bundle_context()
                .map(|c| c.bundle().id()),
            state,
            error_trace,
            services,
            dependencies,
            properties,
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn snapshot(&self) -> (InstanceState, Vec<Arc<dyn Handler>>) {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        (inner.state, inner.handlers.clone())
    }

    fn validate(&self, handlers: &[Arc<dyn Handler>]) {
        debug!(instance = %self.name, "Validating component");
        let callbacks = self.context.factory_context().callbacks().clone();

        if let Some(cb) = &callbacks.validate
            && let Err(e) = self.call_lifecycle_callback(cb)
        {
            error!(instance = %self.name, error = %e, "Error validating component");
            {
                let cell = self.inner.lock();
                let mut inner = cell.borrow_mut();
                inner.state = InstanceState::Erroneous;
                inner.error_trace = Some(render_error_trace(e.as_ref()));
            }
            self.fire(RuntimeEventKind::Invalidated);
            return;
        }

        {
            let cell = self.inner.lock();
            cell.borrow_mut().state = InstanceState::Valid;
        }

        for handler in handlers.iter().filter(|h| h.kind() == HandlerKind::ServiceProvider) {
            handler.register_service();
            if let Some(reference) = handler.service_reference()
                && let Some(cb) = &callbacks.post_registration
            {
                self.logged_registration_callback(cb, &reference, "POST_REGISTRATION");
            }
        }

        for handler in handlers {
            handler.on_validated();
        }
        self.fire(RuntimeEventKind::Validated);
    }

    fn notify_binding(
        &self,
        handler: &dyn Handler,
        state: InstanceState,
        service: &ServiceArc,
        reference: &ServiceReference,
        event: BindingEvent,
    ) {
        let factory_context = self.context.factory_context();

        if let Some(field) = handler.field()
            && let Some(field_callbacks) = factory_context.field_callbacks().get(&field)
        {
            let slot = match event {
                BindingEvent::Bind => &field_callbacks.bind,
                BindingEvent::Update => &field_callbacks.update,
                BindingEvent::Unbind => &field_callbacks.unbind,
            };
            if let Some(field_callback) = slot
                && (!field_callback.if_valid || state == InstanceState::Valid)
            {
                self.logged_binding_callback(
                    &field_callback.callback,
                    service,
                    reference,
                    event.label(),
                );
            }
        }

        let callbacks = factory_context.callbacks();
        let global = match event {
            BindingEvent::Bind => &callbacks.bind,
            BindingEvent::Update => &callbacks.update,
            BindingEvent::Unbind => &callbacks.unbind,
        };
        if let Some(cb) = global {
            self.logged_binding_callback(cb, service, reference, event.label());
        }
    }

    fn with_component<R>(
        &self,
        f: impl FnOnce(&mut dyn crate::component::Component) -> R,
    ) -> Option<R> {
        let component = self.component()?;
        let mut guard = component.lock();
        Some(f(&mut **guard))
    }

    fn call_lifecycle_callback(&self, callback: &LifecycleCallback) -> Result<(), BoxError> {
        self.with_component(|c| callback(c, &self.context))
            .unwrap_or(Ok(()))
    }

    fn logged_lifecycle_callback(&self, callback: &LifecycleCallback, label: &'static str) {
        if let Err(e) = self.call_lifecycle_callback(callback) {
            error!(
                instance = %self.name,
                callback = label,
                error = %e,
                "Error in component callback"
            );
        }
    }

    fn logged_binding_callback(
        &self,
        callback: &BindingCallback,
        service: &ServiceArc,
        reference: &ServiceReference,
        label: &'static str,
    ) {
        let result = self.with_component(|c| callback(c, service, reference));
        if let Some(Err(e)) = result {
            error!(
                instance = %self.name,
                callback = label,
                error = %e,
                "Error in component callback"
            );
        }
    }

    fn logged_registration_callback(
        &self,
        callback: &RegistrationCallback,
        reference: &ServiceReference,
        label: &'static str,
    ) {
        let result = self.with_component(|c| callback(c, reference));
        if let Some(Err(e)) = result {
            error!(
                instance = %self.name,
                callback = label,
                error = %e,
                "Error in component callback"
            );
        }
    }

    fn fire(&self, kind: RuntimeEventKind) {
        self.events.fire(&RuntimeEvent::instance(
            kind,
            self.factory_name.clone(),
            self.name.clone(),
        ));
    }
}

impl fmt::Debug for StoredInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredInstance")
            .field("name", &self.name)
            .field("factory", &self.factory_name)
            .field("state", &self.state())
            .finish()
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── Instance introspection records ──────────────────────────────────────────

/// One dependency, as reported by instance introspection.
#[derive(Debug, Clone)]
pub struct DependencyDetails {
    /// Type name of the dependency handler.
    pub handler: String,
    /// Required specification.
    pub specification: String,
    /// Rendered property filter, if any.
    pub filter: Option<String>,
    /// Whether the requirement is optional.
    pub optional: bool,
    /// Whether the requirement injects multiple services.
    pub aggregate: bool,
    /// References the dependency is currently bound to.
    pub bindings: Vec<ServiceReference>,
}

/// Snapshot of a component instance, as returned by
/// `ComponentRuntime::get_instance_details`.
#[derive(Debug, Clone)]
pub struct InstanceDetails {
    /// Instance name.
    pub name: String,
    /// Factory name.
    pub factory: String,
    /// Id of the bundle declaring the factory, while resolvable.
    pub bundle_id: Option<u64>,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Captured validation failure, when ERRONEOUS.
    pub error_trace: Option<String>,
    /// Provided services: service id to reference.
    pub services: HashMap<u64, ServiceReference>,
    /// Dependencies, keyed by injected field.
    pub dependencies: HashMap<String, DependencyDetails>,
    /// Stringified visible properties.
    pub properties: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::component::component_object;
    use crate::context::{FactoryContextBuilder, Requirement};

    /// A dependency-kind handler whose vote is switched from the test.
    struct VoteHandler {
        satisfied: AtomicBool,
    }

    impl VoteHandler {
        fn new(satisfied: bool) -> Arc<Self> {
            Arc::new(Self {
                satisfied: AtomicBool::new(satisfied),
            })
        }
    }

    impl Handler for VoteHandler {
        fn kind(&self) -> HandlerKind {
            HandlerKind::Dependency
        }

        fn name(&self) -> &'static str {
            "VoteHandler"
        }

        fn check_lifecycle(&self) -> LifecycleVote {
            if self.satisfied.load(Ordering::SeqCst) {
                LifecycleVote::Valid
            } else {
                LifecycleVote::Invalid
            }
        }

        fn field(&self) -> Option<String> {
            Some("svc".to_string())
        }

        fn requirement(&self) -> Option<Requirement> {
            Some(Requirement::new("spec.test"))
        }
    }

    struct Probe {
        validated: u32,
        invalidated: u32,
        throw: bool,
    }

    fn probe_instance(
        handlers: Vec<Arc<dyn Handler>>,
        throw: bool,
    ) -> (Arc<StoredInstance>, ComponentObject) {
        let context = FactoryContextBuilder::new("factory.probe")
            .on_validate(|c, _| {
                let probe = c.as_any_mut().downcast_mut::<Probe>().expect("probe");
                if probe.throw {
                    return Err("validation refused".into());
                }
                probe.validated += 1;
                Ok(())
            })
            .on_invalidate(|c, _| {
                let probe = c.as_any_mut().downcast_mut::<Probe>().expect("probe");
                probe.invalidated += 1;
                Ok(())
            })
            .build()
            .expect("sealed context");
        let component = component_object(Probe {
            validated: 0,
            invalidated: 0,
            throw,
        });
        let instance = StoredInstance::new(
            Arc::new(ComponentContext::new(
                Arc::new(context),
                "probe.1",
                Properties::new(),
            )),
            component.clone(),
            handlers,
            Arc::new(ListenerSet::new()),
        );
        (instance, component)
    }

    fn probe_field<R>(component: &ComponentObject, read: impl FnOnce(&Probe) -> R) -> R {
        crate::component::with_component(component, read).expect("probe")
    }

    #[test]
    fn validates_when_no_handler_vetoes() {
        let (instance, component) = probe_instance(vec![VoteHandler::new(true)], false);
        instance.start();
        assert_eq!(instance.state(), InstanceState::Valid);
        assert_eq!(probe_field(&component, |p| p.validated), 1);
    }

    #[test]
    fn stays_invalid_while_vetoed_then_validates() {
        let vote = VoteHandler::new(false);
        let (instance, _component) = probe_instance(vec![vote.clone()], false);
        instance.start();
        assert_eq!(instance.state(), InstanceState::Invalid);

        vote.satisfied.store(true, Ordering::SeqCst);
        instance.check_lifecycle();
        assert_eq!(instance.state(), InstanceState::Valid);
    }

    #[test]
    fn veto_invalidates_a_valid_instance() {
        let vote = VoteHandler::new(true);
        let (instance, component) = probe_instance(vec![vote.clone()], false);
        instance.start();
        assert_eq!(instance.state(), InstanceState::Valid);

        vote.satisfied.store(false, Ordering::SeqCst);
        instance.check_lifecycle();
        assert_eq!(instance.state(), InstanceState::Invalid);
        assert_eq!(probe_field(&component, |p| p.invalidated), 1);
    }

    #[test]
    fn failing_validate_turns_erroneous_and_retry_recovers() {
        let (instance, component) = probe_instance(Vec::new(), true);
        instance.start();
        assert_eq!(instance.state(), InstanceState::Erroneous);
        let trace = instance.error_trace().expect("trace");
        assert!(trace.contains("validation refused"));

        // Still failing: stays erroneous.
        assert_eq!(instance.retry_erroneous(None), InstanceState::Erroneous);

        // Patch the component, retry again.
        crate::component::with_component_mut(&component, |probe: &mut Probe| {
            probe.throw = false;
        })
        .expect("probe");
        assert_eq!(instance.retry_erroneous(None), InstanceState::Valid);
        assert!(instance.error_trace().is_none());
    }

    #[test]
    fn retry_is_a_noop_off_erroneous() {
        let (instance, component) = probe_instance(Vec::new(), false);
        instance.start();
        assert_eq!(instance.state(), InstanceState::Valid);
        assert_eq!(instance.retry_erroneous(None), InstanceState::Valid);
        // No second VALIDATE ran.
        assert_eq!(probe_field(&component, |p| p.validated), 1);
    }

    #[test]
    fn kill_is_terminal_and_emits_once() {
        struct KillCounter(Mutex<u32>);
        impl crate::events::RuntimeListener for KillCounter {
            fn handle_event(&self, event: &RuntimeEvent) -> Result<(), BoxError> {
                if event.kind == RuntimeEventKind::Killed {
                    *self.0.lock() += 1;
                }
                Ok(())
            }
        }

        let (instance, component) = probe_instance(Vec::new(), false);
        let counter = Arc::new(KillCounter(Mutex::new(0)));
        instance.events.add(counter.clone());

        instance.start();
        assert!(instance.kill());
        assert!(!instance.kill());
        assert_eq!(instance.state(), InstanceState::Killed);
        assert_eq!(*counter.0.lock(), 1);
        assert!(instance.component().is_none());
        // The INVALIDATE callback ran during the kill.
        assert_eq!(probe_field(&component, |p| p.invalidated), 1);
    }
}
