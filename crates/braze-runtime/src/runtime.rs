//! The component runtime: factory and instance registries, the waiting
//! pool, and the public API.
//!
//! [`ComponentRuntime`] owns four locks, always taken in the same order:
//! `factories` → `instances` (which also guards the waiting pool and the
//! auto-restart map) → `handlers` → the per-instance lock → `listeners`.
//! Registry locks are released before user callbacks run and before
//! listeners are invoked; only the per-instance lock is held across a
//! callback.
//!
//! The runtime is also a service listener on the host registry, scoped to
//! handler factory services: handler arrival promotes waiting components,
//! handler departure kills and re-queues the components that depend on it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use braze_core::{
    Bundle, BundleContext, BundleListener, BundleState, Filter, FrameworkStopListener, Properties,
    ServiceArc, ServiceEvent, ServiceEventKind, ServiceListener, ServiceReference,
    ServiceRegistration,
};

use crate::component::ComponentObject;
use crate::context::{ComponentContext, FactoryContext};
use crate::error::{RuntimeError, RuntimeResult};
use crate::events::{ListenerSet, RuntimeEvent, RuntimeEventKind, RuntimeListener};
use crate::factory::{ComponentFactory, FactoryDetails, RequirementDetails};
use crate::handler::{
    HANDLER_FACTORY_SPEC, HANDLER_PROPERTIES, HANDLER_PROVIDES, HANDLER_REQUIRES,
    HandlerFactory, HandlerFactoryService, PROP_HANDLER_ID,
};
use crate::instance::{InstanceDetails, InstanceState, StoredInstance};

/// Specification under which the runtime registers itself.
pub const SERVICE_RUNTIME: &str = "braze.runtime";

/// Component property marking an instance for restart across a bundle
/// update.
pub const PROP_AUTO_RESTART: &str = "braze.auto_restart";

#[derive(Default)]
struct InstanceRegistry {
    instances: HashMap<String, Arc<StoredInstance>>,
    waiting: HashMap<String, (Arc<ComponentContext>, ComponentObject)>,
    auto_restart: HashMap<u64, Vec<(String, String, Properties)>>,
}

#[derive(Default)]
struct HandlerRegistry {
    refs: HashSet<ServiceReference>,
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
}

/// The component runtime service.
pub struct ComponentRuntime {
    context: Arc<dyn BundleContext>,
    factories: Mutex<HashMap<String, ComponentFactory>>,
    instances: Mutex<InstanceRegistry>,
    handlers: Mutex<HandlerRegistry>,
    listeners: Arc<ListenerSet>,
    running: AtomicBool,
    registration: Mutex<Option<ServiceRegistration>>,
    this: Mutex<Weak<ComponentRuntime>>,
}

impl ComponentRuntime {
    /// Installs the runtime on a framework:
    ///
    /// 1. subscribes to handler factory services and adopts the ones
    ///    already registered,
    /// 2. subscribes to bundle and framework-stop events,
    /// 3. registers itself as the [`SERVICE_RUNTIME`] service,
    /// 4. registers the factories contributed by already-active bundles.
    pub fn install(context: Arc<dyn BundleContext>) -> RuntimeResult<Arc<Self>> {
        let runtime = Arc::new(Self {
            context: context.clone(),
            factories: Mutex::new(HashMap::new()),
            instances: Mutex::new(InstanceRegistry::default()),
            handlers: Mutex::new(HandlerRegistry::default()),
            listeners: Arc::new(ListenerSet::new()),
            running: AtomicBool::new(true),
            registration: Mutex::new(None),
            this: Mutex::new(Weak::new()),
        });
        *runtime.this.lock() = Arc::downgrade(&runtime);

        context.add_service_listener(runtime.clone(), Some(HANDLER_FACTORY_SPEC), None);
        for reference in context.get_all_service_references(HANDLER_FACTORY_SPEC) {
            runtime.add_handler_factory(&reference);
        }
        context.add_bundle_listener(runtime.clone());
        context.add_framework_stop_listener(runtime.clone());

        let registration = context.register_service(
            &[SERVICE_RUNTIME],
            runtime.clone() as ServiceArc,
            Properties::new(),
        )?;
        *runtime.registration.lock() = Some(registration);

        for bundle in context.bundles() {
            if bundle.state() == BundleState::Active && bundle.id() != 0 {
                runtime.register_bundle_factories(&bundle);
            }
        }

        info!("Component runtime installed");
        Ok(runtime)
    }

    /// Snapshot of the live stored instances, for the bundle reactor.
    pub(crate) fn live_instances(&self) -> Vec<Arc<StoredInstance>> {
        self.instances.lock().instances.values().cloned().collect()
    }

    /// Appends auto-restart snapshot entries for a bundle.
    pub(crate) fn store_auto_restart(
        &self,
        bundle_id: u64,
        entries: Vec<(String, String, Properties)>,
    ) {
        self.instances
            .lock()
            .auto_restart
            .entry(bundle_id)
            .or_default()
            .extend(entries);
    }

    /// Takes (and clears) the auto-restart snapshot of a bundle.
    pub(crate) fn take_auto_restart(&self, bundle_id: u64) -> Vec<(String, String, Properties)> {
        self.instances
            .lock()
            .auto_restart
            .remove(&bundle_id)
            .unwrap_or_default()
    }

    // ─── Factory registry ────────────────────────────────────────────────────

    /// Registers a factory on behalf of the bundle behind `bundle_context`.
    ///
    /// Fails with [`RuntimeError::DuplicateFactory`] when the name is taken.
    pub fn register_factory(
        &self,
        bundle_context: &Arc<dyn BundleContext>,
        factory: ComponentFactory,
    ) -> RuntimeResult<()> {
        let name = factory.context().name().to_string();
        if name.is_empty() {
            return Err(RuntimeError::InvalidName(name));
        }

        {
            let mut factories = self.factories.lock();
            if factories.contains_key(&name) {
                return Err(RuntimeError::DuplicateFactory(name));
            }
            factory
                .context()
                .attach_bundle_context(Some(Arc::downgrade(bundle_context)));
            factories.insert(name.clone(), factory);
        }
        info!(factory = %name, "Factory registered");
        self.listeners
            .fire(&RuntimeEvent::factory(RuntimeEventKind::Registered, name));
        Ok(())
    }

    /// Unregisters a factory: fires UNREGISTERED, kills every instance of
    /// the factory, then drops its waiting entries. Returns `false` when
    /// the factory is unknown.
    pub fn unregister_factory(&self, factory_name: &str) -> bool {
        let Some(factory) = self.factories.lock().remove(factory_name) else {
            return false;
        };
        info!(factory = %factory_name, "Factory unregistered");
        self.listeners.fire(&RuntimeEvent::factory(
            RuntimeEventKind::Unregistered,
            factory_name,
        ));

        // Kill the live instances. A kill callback may have removed some
        // concurrently; UNKNOWN_INSTANCE is expected mid-iteration.
        let names: Vec<String> = {
            let registry = self.instances.lock();
            registry
                .instances
                .values()
                .filter(|i| i.factory_name() == factory_name)
                .map(|i| i.name().to_string())
                .collect()
        };
        for name in names {
            let _ = self.kill(&name);
        }

        // Drop the waiting entries of this factory.
        {
            let mut registry = self.instances.lock();
            let waiting: Vec<String> = registry
                .waiting
                .iter()
                .filter(|(_, (context, _))| context.factory_context().name() == factory_name)
                .map(|(name, _)| name.clone())
                .collect();
            for name in waiting {
                if let Some((context, _)) = registry.waiting.remove(&name) {
                    context.factory_context().set_singleton_active(false);
                }
            }
        }

        factory.context().attach_bundle_context(None);
        true
    }

    // ─── Instance lifecycle ──────────────────────────────────────────────────

    /// Instantiates a component from `factory_name` under `name`.
    ///
    /// Returns the (possibly still waiting) user object. When a handler
    /// factory is missing, the instance parks in the waiting pool and
    /// surfaces through [`get_waiting_components`](Self::get_waiting_components).
    pub fn instantiate(
        &self,
        factory_name: &str,
        name: &str,
        properties: Option<Properties>,
    ) -> RuntimeResult<ComponentObject> {
        if factory_name.is_empty() {
            return Err(RuntimeError::InvalidName(factory_name.to_string()));
        }
        if name.is_empty() {
            return Err(RuntimeError::InvalidName(name.to_string()));
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(RuntimeError::RuntimeStopping);
        }

        let factory = self
            .factories
            .lock()
            .get(factory_name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownFactory(factory_name.to_string()))?;
        let factory_context = factory.context().clone();

        // Cheap pre-checks before running the user constructor.
        {
            let registry = self.instances.lock();
            if registry.instances.contains_key(name) || registry.waiting.contains_key(name) {
                return Err(RuntimeError::DuplicateInstance(name.to_string()));
            }
            if factory_context.is_singleton() && factory_context.is_singleton_active() {
                return Err(RuntimeError::SingletonActive {
                    factory: factory_name.to_string(),
                    name: name.to_string(),
                });
            }
        }

        // The constructor is user code: no registry lock is held around it.
        let component_box = factory.construct().map_err(|e| {
            error!(
                instance = %name,
                factory = %factory_name,
                error = %e,
                "Error creating the component instance"
            );
            RuntimeError::FactoryRaised {
                factory: factory_name.to_string(),
                name: name.to_string(),
                message: e.to_string(),
            }
        })?;
        let component: ComponentObject = Arc::new(Mutex::new(component_box));

        let merged = self.prepare_instance_properties(properties, &factory_context);

        let stored = {
            let mut registry = self.instances.lock();
            // Re-check: the name may have been taken while the constructor ran.
            if registry.instances.contains_key(name) || registry.waiting.contains_key(name) {
                return Err(RuntimeError::DuplicateInstance(name.to_string()));
            }
            if factory_context.is_singleton() {
                if factory_context.is_singleton_active() {
                    return Err(RuntimeError::SingletonActive {
                        factory: factory_name.to_string(),
                        name: name.to_string(),
                    });
                }
                factory_context.set_singleton_active(true);
            }

            let component_context =
                Arc::new(ComponentContext::new(factory_context, name, merged));
            let handlers = self.handlers.lock();
            match self.try_instantiate(&mut registry, &handlers, &component_context, &component) {
                Some(stored) => Some(stored),
                None => {
                    debug!(instance = %name, factory = %factory_name, "Component waiting for handlers");
                    registry
                        .waiting
                        .insert(name.to_string(), (component_context, component.clone()));
                    None
                }
            }
        };

        if let Some(stored) = stored {
            self.run_up(&stored);
        }
        Ok(component)
    }

    /// Resolves the handler factories a context names, produces the handler
    /// set, and registers the stored instance. Returns `None` when a
    /// handler id is unresolved (the caller parks the component).
    ///
    /// Called with the instances lock held and the handler registry pinned
    /// by the caller.
    fn try_instantiate(
        &self,
        registry: &mut InstanceRegistry,
        handlers: &HandlerRegistry,
        context: &Arc<ComponentContext>,
        component: &ComponentObject,
    ) -> Option<Arc<StoredInstance>> {
        let mut handler_factories = Vec::new();
        for id in context.factory_context().get_handlers_ids() {
            handler_factories.push(handlers.factories.get(&id)?.clone());
        }

        let mut all_handlers = Vec::new();
        for handler_factory in handler_factories {
            all_handlers.extend(handler_factory.get_handlers(context, component));
        }

        let stored = StoredInstance::new(
            context.clone(),
            component.clone(),
            all_handlers,
            self.listeners.clone(),
        );
        for handler in stored.get_handlers(None) {
            handler.manipulate(&stored);
        }
        registry
            .instances
            .insert(context.name().to_string(), stored.clone());
        Some(stored)
    }

    /// Drives a freshly registered instance: INSTANTIATED, handler start,
    /// initial bindings, first lifecycle check. No registry lock is held.
    fn run_up(&self, stored: &Arc<StoredInstance>) {
        self.listeners.fire(&RuntimeEvent::instance(
            RuntimeEventKind::Instantiated,
            stored.factory_name(),
            stored.name(),
        ));
        stored.start();
        stored.update_bindings();
        stored.check_lifecycle();
    }

    /// Merges the caller properties with framework properties: framework
    /// values only fill declared factory properties the caller left absent.
    fn prepare_instance_properties(
        &self,
        properties: Option<Properties>,
        factory_context: &Arc<FactoryContext>,
    ) -> Properties {
        let mut properties = properties.unwrap_or_default();
        for key in factory_context.properties().keys() {
            if !properties.contains_key(key)
                && let Some(value) = self.context.framework_property(key)
            {
                properties.insert(key.clone(), value);
            }
        }
        properties
    }

    /// Kills an instance (running or waiting) and frees its name.
    pub fn kill(&self, name: &str) -> RuntimeResult<()> {
        if name.is_empty() {
            return Err(RuntimeError::InvalidName(name.to_string()));
        }
        let stored = {
            let mut registry = self.instances.lock();
            if let Some(stored) = registry.instances.remove(name) {
                Some(stored)
            } else if let Some((context, _)) = registry.waiting.remove(name) {
                context.factory_context().set_singleton_active(false);
                return Ok(());
            } else {
                return Err(RuntimeError::UnknownInstance(name.to_string()));
            }
        };
        if let Some(stored) = stored {
            stored.kill();
            stored.context().factory_context().set_singleton_active(false);
        }
        Ok(())
    }

    /// Invalidates a VALID instance, running its INVALIDATE callback.
    pub fn invalidate(&self, name: &str) -> RuntimeResult<()> {
        let stored = self.get_stored_instance(name)?;
        stored.invalidate(true);
        Ok(())
    }

    /// Clears the ERRONEOUS state of an instance and retries validation.
    /// Returns the resulting state.
    pub fn retry_erroneous(
        &self,
        name: &str,
        properties: Option<Properties>,
    ) -> RuntimeResult<InstanceState> {
        let stored = self.get_stored_instance(name)?;
        Ok(stored.retry_erroneous(properties.as_ref()))
    }

    fn get_stored_instance(&self, name: &str) -> RuntimeResult<Arc<StoredInstance>> {
        self.instances
            .lock()
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownInstance(name.to_string()))
    }

    // ─── Handler factory churn ───────────────────────────────────────────────

    /// Adopts a newly registered handler factory and re-attempts every
    /// waiting component. Duplicate handler ids are ignored: the first
    /// registration stays authoritative.
    fn add_handler_factory(&self, reference: &ServiceReference) {
        let Some(handler_id) = reference
            .get_property(PROP_HANDLER_ID)
            .and_then(|v| v.as_str().map(str::to_string))
        else {
            warn!(service = reference.id(), "Handler factory without a handler id");
            return;
        };

        let promoted: Vec<Arc<StoredInstance>> = {
            let mut registry = self.instances.lock();
            let mut handlers = self.handlers.lock();
            if handlers.factories.contains_key(&handler_id) {
                warn!(handler = %handler_id, "Already registered handler ID");
                return;
            }
            let Some(service) = self.context.get_service(reference) else {
                warn!(handler = %handler_id, "Handler factory service is gone");
                return;
            };
            let Some(factory_service) = service.downcast_ref::<HandlerFactoryService>() else {
                warn!(handler = %handler_id, "Service is not a handler factory");
                self.context.unget_service(reference);
                return;
            };
            handlers.refs.insert(reference.clone());
            handlers
                .factories
                .insert(handler_id.clone(), factory_service.factory());
            debug!(handler = %handler_id, "Handler factory registered");

            let waiting_names: Vec<String> = registry.waiting.keys().cloned().collect();
            let mut promoted = Vec::new();
            for name in waiting_names {
                let Some((context, component)) = registry.waiting.get(&name).cloned() else {
                    continue;
                };
                if let Some(stored) =
                    self.try_instantiate(&mut registry, &handlers, &context, &component)
                {
                    registry.waiting.remove(&name);
                    promoted.push(stored);
                }
            }
            promoted
        };

        for stored in promoted {
            self.run_up(&stored);
        }
    }

    /// Reacts to a handler factory departure: every instance whose factory
    /// context lists the handler id is killed and re-queued with its
    /// existing user object; a same-id replacement present in the registry
    /// is promoted immediately.
    fn remove_handler_factory(&self, reference: &ServiceReference) {
        let Some(handler_id) = reference
            .get_property(PROP_HANDLER_ID)
            .and_then(|v| v.as_str().map(str::to_string))
        else {
            return;
        };

        let to_kill: Vec<Arc<StoredInstance>> = {
            let mut registry = self.instances.lock();
            let mut handlers = self.handlers.lock();
            if !handlers.refs.remove(reference) {
                return;
            }
            self.context.unget_service(reference);
            handlers.factories.remove(&handler_id);
            debug!(handler = %handler_id, "Handler factory unregistered");

            let affected: Vec<String> = registry
                .instances
                .values()
                .filter(|stored| {
                    stored
                        .context()
                        .factory_context()
                        .get_handlers_ids()
                        .contains(&handler_id)
                })
                .map(|stored| stored.name().to_string())
                .collect();

            let mut to_kill = Vec::new();
            for name in affected {
                let Some(stored) = registry.instances.remove(&name) else {
                    continue;
                };
                let Some(component) = stored.component() else {
                    continue;
                };
                registry
                    .waiting
                    .insert(name, (stored.context().clone(), component));
                to_kill.push(stored);
            }
            to_kill
        };

        for stored in to_kill {
            stored.kill();
        }

        // Promote a replacement with the same id, if one is registered.
        let replacement = self.context.get_service_reference(
            HANDLER_FACTORY_SPEC,
            Some(&Filter::eq(PROP_HANDLER_ID, handler_id)),
        );
        if let Some(reference) = replacement {
            self.add_handler_factory(&reference);
        }
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    /// Whether a factory with that name is registered.
    pub fn is_registered_factory(&self, name: &str) -> bool {
        self.factories.lock().contains_key(name)
    }

    /// Whether an instance with that name is running or waiting.
    pub fn is_registered_instance(&self, name: &str) -> bool {
        let registry = self.instances.lock();
        registry.instances.contains_key(name) || registry.waiting.contains_key(name)
    }

    /// `(name, factory, state)` of every running instance, sorted by name.
    pub fn get_instances(&self) -> Vec<(String, String, InstanceState)> {
        let registry = self.instances.lock();
        let mut instances: Vec<_> = registry
            .instances
            .values()
            .map(|stored| {
                (
                    stored.name().to_string(),
                    stored.factory_name().to_string(),
                    stored.state(),
                )
            })
            .collect();
        instances.sort_by(|a, b| a.0.cmp(&b.0));
        instances
    }

    /// `(name, factory, missing handler ids)` of every waiting component,
    /// sorted by name.
    pub fn get_waiting_components(&self) -> Vec<(String, String, BTreeSet<String>)> {
        let registry = self.instances.lock();
        let handlers = self.handlers.lock();
        let mut waiting: Vec<_> = registry
            .waiting
            .iter()
            .map(|(name, (context, _))| {
                let missing: BTreeSet<String> = context
                    .factory_context()
                    .get_handlers_ids()
                    .into_iter()
                    .filter(|id| !handlers.factories.contains_key(id))
                    .collect();
                (
                    name.clone(),
                    context.factory_context().name().to_string(),
                    missing,
                )
            })
            .collect();
        waiting.sort();
        waiting
    }

    /// Snapshot of one running instance.
    pub fn get_instance_details(&self, name: &str) -> RuntimeResult<InstanceDetails> {
        Ok(self.get_stored_instance(name)?.details())
    }

    /// Names of the registered factories, sorted.
    pub fn get_factories(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// The bundle that registered the given factory.
    pub fn get_factory_bundle(&self, name: &str) -> RuntimeResult<Bundle> {
        let factories = self.factories.lock();
        let factory = factories
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownFactory(name.to_string()))?;
        factory
            .context()
            .bundle_context()
            .map(|context| context.bundle())
            .ok_or_else(|| RuntimeError::UnknownFactory(name.to_string()))
    }

    /// Snapshot of one registered factory.
    pub fn get_factory_details(&self, name: &str) -> RuntimeResult<FactoryDetails> {
        let factory = self
            .factories
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownFactory(name.to_string()))?;
        let context = factory.context();

        let properties: Properties = context
            .properties_fields()
            .values()
            .filter_map(|property| {
                context
                    .properties()
                    .get(property)
                    .map(|value| (property.clone(), value.clone()))
            })
            .collect();

        let requirements = context
            .requirements()
            .iter()
            .map(|(field, requirement)| RequirementDetails {
                id: field.clone(),
                specification: requirement.specification.clone(),
                aggregate: requirement.aggregate,
                optional: requirement.optional,
                filter: requirement.filter.as_ref().map(Filter::to_string),
            })
            .collect();

        let services = context
            .provides()
            .iter()
            .map(|provided| provided.specifications.clone())
            .collect();

        let builtin = [HANDLER_PROPERTIES, HANDLER_PROVIDES, HANDLER_REQUIRES];
        let handler_registry = self.handlers.lock();
        let handlers = context
            .get_handlers_ids()
            .into_iter()
            .filter(|id| !builtin.contains(&id.as_str()))
            .map(|id| {
                let config = context.get_handler(&id).cloned().unwrap_or_default();
                let available = handler_registry.factories.contains_key(&id);
                (id, (config, available))
            })
            .collect();

        Ok(FactoryDetails {
            name: context.name().to_string(),
            bundle: context.bundle_context().map(|c| c.bundle()),
            properties,
            requirements,
            services,
            handlers,
        })
    }

    // ─── Listeners ───────────────────────────────────────────────────────────

    /// Subscribes a runtime event listener. Returns `false` when it was
    /// already subscribed.
    pub fn add_listener(&self, listener: Arc<dyn RuntimeListener>) -> bool {
        self.listeners.add(listener)
    }

    /// Unsubscribes a runtime event listener. Returns `false` when it was
    /// not subscribed.
    pub fn remove_listener(&self, listener: &Arc<dyn RuntimeListener>) -> bool {
        self.listeners.remove(listener)
    }

    // ─── Shutdown ────────────────────────────────────────────────────────────

    /// Whether the runtime accepts new instantiations.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops accepting work and releases the handler factory references.
    fn deactivate(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(me) = self.this.lock().upgrade() {
            let listener: Arc<dyn ServiceListener> = me;
            self.context.remove_service_listener(&listener);
        }
        let mut handlers = self.handlers.lock();
        for reference in handlers.refs.drain() {
            self.context.unget_service(&reference);
        }
        handlers.factories.clear();
        info!("Component runtime stopped");
    }

    /// Full teardown: deactivates, detaches every framework listener,
    /// withdraws the runtime service, and kill-cascades all factories.
    pub fn shutdown(self: &Arc<Self>) {
        self.deactivate();
        let bundle_listener: Arc<dyn BundleListener> = self.clone();
        self.context.remove_bundle_listener(&bundle_listener);
        let stop_listener: Arc<dyn FrameworkStopListener> = self.clone();
        self.context.remove_framework_stop_listener(&stop_listener);
        if let Some(registration) = self.registration.lock().take() {
            registration.unregister();
        }
        for name in self.get_factories() {
            self.unregister_factory(&name);
        }
    }
}

impl ServiceListener for ComponentRuntime {
    /// Reacts to handler factory arrival and departure.
    fn service_changed(&self, event: &ServiceEvent) {
        match event.kind {
            ServiceEventKind::Registered => self.add_handler_factory(&event.reference),
            ServiceEventKind::Unregistering => self.remove_handler_factory(&event.reference),
            ServiceEventKind::Modified => {}
        }
    }
}

impl FrameworkStopListener for ComponentRuntime {
    fn framework_stopping(&self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{Value, json};

    use braze_core::BoxError;
    use braze_framework::Framework;

    use crate::builtin::{RequiresHandlerFactory, register_builtin_handlers};
    use crate::component::Component;
    use crate::context::{FactoryContextBuilder, Requirement};
    use crate::handler::HandlerFactoryService;

    const SPEC_STORE: &str = "test.store";
    const SPEC_CONSUMER: &str = "test.consumer";

    struct Consumer;

    struct Flaky {
        throw: bool,
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<RuntimeEvent>>,
    }

    impl RuntimeListener for Recorder {
        fn handle_event(&self, event: &RuntimeEvent) -> Result<(), BoxError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    impl Recorder {
        fn kinds_for(&self, instance: &str) -> Vec<RuntimeEventKind> {
            self.events
                .lock()
                .iter()
                .filter(|e| e.instance.as_deref() == Some(instance))
                .map(|e| e.kind)
                .collect()
        }

        fn kinds(&self) -> Vec<RuntimeEventKind> {
            self.events.lock().iter().map(|e| e.kind).collect()
        }
    }

    struct Harness {
        framework: Framework,
        runtime: Arc<ComponentRuntime>,
        handler_registrations: Vec<ServiceRegistration>,
        recorder: Arc<Recorder>,
    }

    impl Harness {
        fn new() -> Self {
            let framework = Framework::new(Properties::new());
            let runtime = ComponentRuntime::install(framework.context()).expect("runtime");
            let handler_registrations =
                register_builtin_handlers(&framework.context()).expect("builtin handlers");
            let recorder = Arc::new(Recorder::default());
            runtime.add_listener(recorder.clone());
            Self {
                framework,
                runtime,
                handler_registrations,
                recorder,
            }
        }

        fn context(&self) -> Arc<dyn BundleContext> {
            self.framework.context()
        }

        /// The registration of the built-in `requires` handler factory.
        fn requires_registration(&self) -> &ServiceRegistration {
            &self.handler_registrations[2]
        }

        fn register_store(&self, properties: Properties) -> ServiceRegistration {
            self.context()
                .register_service(&[SPEC_STORE], Arc::new("store".to_string()), properties)
                .expect("store registration")
        }

        fn install_consumer_factory(&self, name: &str, requirement: Requirement) {
            let context = FactoryContextBuilder::new(name)
                .requires("svc", requirement)
                .provides(&[SPEC_CONSUMER])
                .build()
                .expect("sealed context");
            let factory =
                ComponentFactory::new(context, || Ok(Box::new(Consumer) as Box<dyn Component>));
            self.runtime
                .register_factory(&self.context(), factory)
                .expect("factory registration");
        }

        fn register_requires_handler(&self) -> ServiceRegistration {
            let mut properties = Properties::new();
            properties.insert(PROP_HANDLER_ID.to_string(), Value::from(HANDLER_REQUIRES));
            self.context()
                .register_service(
                    &[HANDLER_FACTORY_SPEC],
                    HandlerFactoryService::into_service(Arc::new(RequiresHandlerFactory)),
                    properties,
                )
                .expect("requires handler registration")
        }

        fn assert_registries_disjoint(&self) {
            let running: BTreeSet<String> = self
                .runtime
                .get_instances()
                .into_iter()
                .map(|(name, _, _)| name)
                .collect();
            for (name, _, _) in self.runtime.get_waiting_components() {
                assert!(!running.contains(&name), "'{name}' is both running and waiting");
            }
        }
    }

    fn position(kinds: &[RuntimeEventKind], kind: RuntimeEventKind) -> usize {
        kinds
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_else(|| panic!("missing event {kind:?} in {kinds:?}"))
    }

    // ─── Wiring and validation ───────────────────────────────────────────────

    #[test]
    fn happy_path_binds_and_validates() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE));
        let store = harness.register_store(Properties::new());

        harness
            .runtime
            .instantiate("F", "c1", None)
            .expect("instantiation");

        let kinds = harness.recorder.kinds();
        let registered = position(&kinds, RuntimeEventKind::Registered);
        let instantiated = position(&kinds, RuntimeEventKind::Instantiated);
        let validated = position(&kinds, RuntimeEventKind::Validated);
        assert!(registered < instantiated && instantiated < validated);

        let details = harness
            .runtime
            .get_instance_details("c1")
            .expect("details");
        assert_eq!(details.state, InstanceState::Valid);
        assert_eq!(details.factory, "F");
        let dependency = &details.dependencies["svc"];
        assert_eq!(dependency.specification, SPEC_STORE);
        assert_eq!(dependency.bindings, vec![store.reference().clone()]);
        // The provided service is registered.
        assert_eq!(details.services.len(), 1);
        assert!(
            harness
                .context()
                .get_service_reference(SPEC_CONSUMER, None)
                .is_some()
        );
        harness.assert_registries_disjoint();
    }

    // ─── Waiting pool ────────────────────────────────────────────────────────

    #[test]
    fn missing_handler_queues_then_promotes() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE));
        harness.register_store(Properties::new());

        harness.requires_registration().unregister();

        let object = harness
            .runtime
            .instantiate("F", "c2", None)
            .expect("instantiation");
        assert!(Arc::strong_count(&object) > 1);
        assert!(harness.runtime.is_registered_instance("c2"));
        assert!(harness.runtime.get_instance_details("c2").is_err());

        let waiting = harness.runtime.get_waiting_components();
        assert_eq!(waiting.len(), 1);
        let (name, factory, missing) = &waiting[0];
        assert_eq!(name, "c2");
        assert_eq!(factory, "F");
        assert_eq!(missing, &BTreeSet::from([HANDLER_REQUIRES.to_string()]));
        harness.assert_registries_disjoint();

        // The handler returns: the component is promoted and validated.
        let _requires = harness.register_requires_handler();
        assert!(harness.runtime.get_waiting_components().is_empty());
        let kinds = harness.recorder.kinds_for("c2");
        assert!(kinds.contains(&RuntimeEventKind::Validated));
        assert_eq!(
            harness
                .runtime
                .get_instance_details("c2")
                .expect("details")
                .state,
            InstanceState::Valid
        );
        harness.assert_registries_disjoint();
    }

    // ─── Singleton factories ─────────────────────────────────────────────────

    #[test]
    fn singleton_factory_admits_one_instance() {
        let harness = Harness::new();
        let context = FactoryContextBuilder::new("G")
            .singleton()
            .build()
            .expect("sealed context");
        let factory =
            ComponentFactory::new(context, || Ok(Box::new(Consumer) as Box<dyn Component>));
        harness
            .runtime
            .register_factory(&harness.context(), factory)
            .expect("factory registration");

        harness
            .runtime
            .instantiate("G", "g1", None)
            .expect("first instance");
        let second = harness.runtime.instantiate("G", "g2", None);
        assert!(matches!(second, Err(RuntimeError::SingletonActive { .. })));

        harness.runtime.kill("g1").expect("kill");
        harness
            .runtime
            .instantiate("G", "g2", None)
            .expect("slot freed");
    }

    // ─── Erroneous validation ────────────────────────────────────────────────

    #[test]
    fn failing_validation_is_erroneous_until_retried() {
        let harness = Harness::new();
        let context = FactoryContextBuilder::new("H")
            .provides(&[SPEC_CONSUMER])
            .on_validate(|component, _| {
                let flaky = component
                    .as_any_mut()
                    .downcast_mut::<Flaky>()
                    .expect("component type");
                if flaky.throw {
                    return Err("broken validation".into());
                }
                Ok(())
            })
            .build()
            .expect("sealed context");
        let factory = ComponentFactory::new(context, || {
            Ok(Box::new(Flaky { throw: true }) as Box<dyn Component>)
        });
        harness
            .runtime
            .register_factory(&harness.context(), factory)
            .expect("factory registration");

        let object = harness
            .runtime
            .instantiate("H", "h1", None)
            .expect("instantiation");

        let details = harness.runtime.get_instance_details("h1").expect("details");
        assert_eq!(details.state, InstanceState::Erroneous);
        assert!(details.error_trace.expect("trace").contains("broken validation"));
        // Provided services are not registered while erroneous.
        assert!(
            harness
                .context()
                .get_service_reference(SPEC_CONSUMER, None)
                .is_none()
        );

        // Still throwing: the retry leaves the state untouched.
        assert_eq!(
            harness.runtime.retry_erroneous("h1", None).expect("retry"),
            InstanceState::Erroneous
        );

        // Patch the user object, retry again.
        crate::component::with_component_mut(&object, |flaky: &mut Flaky| {
            flaky.throw = false;
        })
        .expect("component type");
        assert_eq!(
            harness.runtime.retry_erroneous("h1", None).expect("retry"),
            InstanceState::Valid
        );
        assert!(
            harness
                .context()
                .get_service_reference(SPEC_CONSUMER, None)
                .is_some()
        );
    }

    // ─── Bundle updates ──────────────────────────────────────────────────────

    fn plain_factory(name: &str) -> ComponentFactory {
        let context = FactoryContextBuilder::new(name)
            .build()
            .expect("sealed context");
        ComponentFactory::new(context, || Ok(Box::new(Consumer) as Box<dyn Component>))
    }

    #[test]
    fn bundle_update_restarts_marked_instances() {
        let harness = Harness::new();
        let bundle = harness.framework.install_bundle("bundle.b");
        bundle.contribute(plain_factory("F").into_contribution());
        harness.framework.start_bundle(&bundle);
        assert!(harness.runtime.is_registered_factory("F"));

        let mut restartable = Properties::new();
        restartable.insert(PROP_AUTO_RESTART.to_string(), json!(true));
        restartable.insert("marker".to_string(), json!("v1"));
        harness
            .runtime
            .instantiate("F", "c1", Some(restartable))
            .expect("c1");
        harness.runtime.instantiate("F", "c2", None).expect("c2");

        harness.framework.update_bundle(&bundle);

        // c1 came back with identical properties; c2 did not.
        assert!(harness.runtime.is_registered_instance("c1"));
        assert!(!harness.runtime.is_registered_instance("c2"));
        let details = harness.runtime.get_instance_details("c1").expect("details");
        assert_eq!(details.state, InstanceState::Valid);
        assert_eq!(details.properties.get("marker").map(String::as_str), Some("v1"));

        // Both incarnations of c1 were killed and re-instantiated.
        let kinds = harness.recorder.kinds_for("c1");
        assert!(kinds.contains(&RuntimeEventKind::Killed));
        assert_eq!(
            kinds.iter().filter(|k| **k == RuntimeEventKind::Instantiated).count(),
            2
        );
    }

    #[test]
    fn failed_bundle_update_discards_the_snapshot() {
        let harness = Harness::new();
        let bundle = harness.framework.install_bundle("bundle.b");
        bundle.contribute(plain_factory("F").into_contribution());
        harness.framework.start_bundle(&bundle);

        let mut restartable = Properties::new();
        restartable.insert(PROP_AUTO_RESTART.to_string(), json!(true));
        harness
            .runtime
            .instantiate("F", "c1", Some(restartable))
            .expect("c1");

        harness.framework.fail_update_bundle(&bundle);
        // The old revision stays live and no replay happened.
        assert!(harness.runtime.is_registered_instance("c1"));
        assert_eq!(
            harness
                .recorder
                .kinds_for("c1")
                .iter()
                .filter(|k| **k == RuntimeEventKind::Instantiated)
                .count(),
            1
        );
    }

    #[test]
    fn declared_instances_start_with_their_bundle() {
        let harness = Harness::new();
        let context = FactoryContextBuilder::new("F")
            .instance("auto.0", Properties::new())
            .expect("declared instance")
            .build()
            .expect("sealed context");
        let factory =
            ComponentFactory::new(context, || Ok(Box::new(Consumer) as Box<dyn Component>));

        let bundle = harness.framework.install_bundle("bundle.b");
        bundle.contribute(factory.into_contribution());
        harness.framework.start_bundle(&bundle);

        assert!(harness.runtime.is_registered_instance("auto.0"));
        assert_eq!(
            harness.runtime.get_factory_bundle("F").expect("bundle").id(),
            bundle.id()
        );
    }

    // ─── Handler factory churn ───────────────────────────────────────────────

    #[test]
    fn handler_departure_kills_requeues_and_repromotes() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE));
        harness.register_store(Properties::new());
        harness
            .runtime
            .instantiate("F", "c1", None)
            .expect("instantiation");
        assert_eq!(
            harness.runtime.get_instance_details("c1").expect("details").state,
            InstanceState::Valid
        );

        harness.requires_registration().unregister();

        // INVALIDATED then KILLED, and the name moved to the waiting pool.
        let kinds = harness.recorder.kinds_for("c1");
        let invalidated = position(&kinds, RuntimeEventKind::Invalidated);
        let killed = position(&kinds, RuntimeEventKind::Killed);
        assert!(invalidated < killed);
        assert!(harness.runtime.get_instances().is_empty());
        assert_eq!(harness.runtime.get_waiting_components().len(), 1);
        harness.assert_registries_disjoint();
        // The provided service went away with the instance.
        assert!(
            harness
                .context()
                .get_service_reference(SPEC_CONSUMER, None)
                .is_none()
        );

        // A replacement handler factory re-promotes the component.
        let _requires = harness.register_requires_handler();
        let kinds = harness.recorder.kinds_for("c1");
        let instantiated_again = kinds
            .iter()
            .rposition(|k| *k == RuntimeEventKind::Instantiated)
            .expect("second INSTANTIATED");
        assert!(instantiated_again > killed);
        assert_eq!(
            harness.runtime.get_instance_details("c1").expect("details").state,
            InstanceState::Valid
        );
        assert!(harness.runtime.get_waiting_components().is_empty());
    }

    // ─── Registry discipline ─────────────────────────────────────────────────

    #[test]
    fn factory_round_trip_leaves_no_state() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE).optional());
        harness
            .runtime
            .instantiate("F", "c1", None)
            .expect("instantiation");

        assert!(harness.runtime.unregister_factory("F"));
        assert!(!harness.runtime.unregister_factory("F"));

        assert!(harness.runtime.get_factories().is_empty());
        assert!(harness.runtime.get_instances().is_empty());
        assert!(harness.runtime.get_waiting_components().is_empty());
        assert!(!harness.runtime.is_registered_instance("c1"));
    }

    #[test]
    fn second_kill_reports_unknown_instance() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE).optional());
        harness
            .runtime
            .instantiate("F", "c1", None)
            .expect("instantiation");

        harness.runtime.kill("c1").expect("first kill");
        assert!(matches!(
            harness.runtime.kill("c1"),
            Err(RuntimeError::UnknownInstance(_))
        ));
    }

    #[test]
    fn retry_on_a_valid_instance_is_a_noop() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE).optional());
        harness
            .runtime
            .instantiate("F", "c1", None)
            .expect("instantiation");

        assert_eq!(
            harness.runtime.retry_erroneous("c1", None).expect("retry"),
            InstanceState::Valid
        );
    }

    // ─── Dynamic dependency behaviour ────────────────────────────────────────

    #[test]
    fn dependency_follows_service_departure_and_return() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE));
        let store = harness.register_store(Properties::new());
        harness
            .runtime
            .instantiate("F", "c1", None)
            .expect("instantiation");

        store.unregister();
        assert_eq!(
            harness.runtime.get_instance_details("c1").expect("details").state,
            InstanceState::Invalid
        );

        harness.register_store(Properties::new());
        assert_eq!(
            harness.runtime.get_instance_details("c1").expect("details").state,
            InstanceState::Valid
        );
    }

    #[test]
    fn immediate_rebind_survives_a_departure() {
        let harness = Harness::new();
        harness.install_consumer_factory(
            "F",
            Requirement::new(SPEC_STORE).immediate_rebind(),
        );
        let first = harness.register_store(Properties::new());
        let second = harness.register_store(Properties::new());
        harness
            .runtime
            .instantiate("F", "c1", None)
            .expect("instantiation");

        first.unregister();

        let details = harness.runtime.get_instance_details("c1").expect("details");
        assert_eq!(details.state, InstanceState::Valid);
        assert_eq!(
            details.dependencies["svc"].bindings,
            vec![second.reference().clone()]
        );
        // The hand-over never invalidated the instance.
        assert!(
            !harness
                .recorder
                .kinds_for("c1")
                .contains(&RuntimeEventKind::Invalidated)
        );
    }

    #[test]
    fn filtered_requirement_reacts_to_property_changes() {
        let harness = Harness::new();
        harness.install_consumer_factory(
            "F",
            Requirement::new(SPEC_STORE).filter(Filter::eq("lang", "fr")),
        );
        let store = harness.register_store(Properties::new());
        harness
            .runtime
            .instantiate("F", "c1", None)
            .expect("instantiation");
        assert_eq!(
            harness.runtime.get_instance_details("c1").expect("details").state,
            InstanceState::Invalid
        );

        // The service starts matching: MODIFIED binds it.
        let mut properties = Properties::new();
        properties.insert("lang".to_string(), json!("fr"));
        store.set_properties(properties);
        assert_eq!(
            harness.runtime.get_instance_details("c1").expect("details").state,
            InstanceState::Valid
        );

        // And stops matching: MODIFIED unbinds it again.
        store.set_properties(Properties::new());
        assert_eq!(
            harness.runtime.get_instance_details("c1").expect("details").state,
            InstanceState::Invalid
        );
    }

    #[test]
    fn aggregate_dependency_collects_every_match() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE).aggregate());
        let first = harness.register_store(Properties::new());
        harness
            .runtime
            .instantiate("F", "c1", None)
            .expect("instantiation");
        let second = harness.register_store(Properties::new());

        let details = harness.runtime.get_instance_details("c1").expect("details");
        assert_eq!(details.state, InstanceState::Valid);
        assert_eq!(
            details.dependencies["svc"].bindings,
            vec![first.reference().clone(), second.reference().clone()]
        );

        // One of two gone: still valid. Both gone: invalid.
        first.unregister();
        assert_eq!(
            harness.runtime.get_instance_details("c1").expect("details").state,
            InstanceState::Valid
        );
        second.unregister();
        assert_eq!(
            harness.runtime.get_instance_details("c1").expect("details").state,
            InstanceState::Invalid
        );
    }

    // ─── Introspection and shutdown ──────────────────────────────────────────

    #[test]
    fn factory_details_report_the_declared_shape() {
        let harness = Harness::new();
        let context = FactoryContextBuilder::new("F")
            .property("level", "log.level", "info")
            .requires("svc", Requirement::new(SPEC_STORE).optional())
            .provides(&[SPEC_CONSUMER])
            .handler("custom.handler", json!({"mode": "fast"}))
            .build()
            .expect("sealed context");
        let factory =
            ComponentFactory::new(context, || Ok(Box::new(Consumer) as Box<dyn Component>));
        harness
            .runtime
            .register_factory(&harness.context(), factory)
            .expect("factory registration");

        let details = harness.runtime.get_factory_details("F").expect("details");
        assert_eq!(details.name, "F");
        assert_eq!(details.bundle.expect("bundle").id(), 0);
        assert_eq!(details.properties.get("log.level"), Some(&json!("info")));
        assert_eq!(details.requirements.len(), 1);
        assert!(details.requirements[0].optional);
        assert_eq!(details.services, vec![vec![SPEC_CONSUMER.to_string()]]);
        // The custom handler is reported, with its availability flag.
        let (config, available) = &details.handlers["custom.handler"];
        assert_eq!(config, &json!({"mode": "fast"}));
        assert!(!available);
        // Built-in handlers are not part of the custom handler map.
        assert!(!details.handlers.contains_key(HANDLER_REQUIRES));
    }

    #[test]
    fn instantiate_validates_its_arguments() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE).optional());

        assert!(matches!(
            harness.runtime.instantiate("", "c1", None),
            Err(RuntimeError::InvalidName(_))
        ));
        assert!(matches!(
            harness.runtime.instantiate("F", "", None),
            Err(RuntimeError::InvalidName(_))
        ));
        assert!(matches!(
            harness.runtime.instantiate("nope", "c1", None),
            Err(RuntimeError::UnknownFactory(_))
        ));

        harness.runtime.instantiate("F", "c1", None).expect("instantiation");
        assert!(matches!(
            harness.runtime.instantiate("F", "c1", None),
            Err(RuntimeError::DuplicateInstance(_))
        ));
        assert!(matches!(
            harness.runtime.retry_erroneous("ghost", None),
            Err(RuntimeError::UnknownInstance(_))
        ));
        assert!(matches!(
            harness.runtime.invalidate("ghost"),
            Err(RuntimeError::UnknownInstance(_))
        ));
    }

    #[test]
    fn constructor_failure_is_reported_and_leaks_nothing() {
        let harness = Harness::new();
        let context = FactoryContextBuilder::new("G")
            .singleton()
            .build()
            .expect("sealed context");
        let factory = ComponentFactory::new(context, || Err("constructor exploded".into()));
        harness
            .runtime
            .register_factory(&harness.context(), factory)
            .expect("factory registration");

        let result = harness.runtime.instantiate("G", "g1", None);
        assert!(matches!(result, Err(RuntimeError::FactoryRaised { .. })));
        assert!(!harness.runtime.is_registered_instance("g1"));
        // The singleton slot was not consumed by the failed attempt: a new
        // request fails in the constructor again, not on the singleton.
        assert!(matches!(
            harness.runtime.instantiate("G", "g2", None),
            Err(RuntimeError::FactoryRaised { .. })
        ));
        assert!(harness.runtime.get_instances().is_empty());
    }

    #[test]
    fn framework_stop_refuses_new_work() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE).optional());

        harness.framework.stop();
        assert!(!harness.runtime.is_running());
        assert!(matches!(
            harness.runtime.instantiate("F", "c1", None),
            Err(RuntimeError::RuntimeStopping)
        ));
    }

    #[test]
    fn shutdown_kill_cascades_everything() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE).optional());
        harness
            .runtime
            .instantiate("F", "c1", None)
            .expect("instantiation");

        harness.runtime.shutdown();

        assert!(harness.runtime.get_factories().is_empty());
        assert!(harness.runtime.get_instances().is_empty());
        assert!(
            harness
                .context()
                .get_service_reference(SERVICE_RUNTIME, None)
                .is_none()
        );
        let kinds = harness.recorder.kinds_for("c1");
        assert!(kinds.contains(&RuntimeEventKind::Killed));
    }

    #[test]
    fn bound_and_unbound_events_are_emitted() {
        let harness = Harness::new();
        harness.install_consumer_factory("F", Requirement::new(SPEC_STORE).optional());
        harness
            .runtime
            .instantiate("F", "c1", None)
            .expect("instantiation");

        let store = harness.register_store(Properties::new());
        store.unregister();

        let kinds = harness.recorder.kinds_for("c1");
        let bound = position(&kinds, RuntimeEventKind::Bound);
        let unbound = position(&kinds, RuntimeEventKind::Unbound);
        assert!(bound < unbound);
    }
}
