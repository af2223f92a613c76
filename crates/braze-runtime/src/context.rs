//! Factory and component contexts.
//!
//! A [`FactoryContext`] is the sealed descriptor of a component type: its
//! declared properties, provided and required services, lifecycle callbacks,
//! and the handler ids it depends on. It is built once through
//! [`FactoryContextBuilder`] and never restructured afterwards — only the
//! singleton-active flag and the bundle back-reference mutate.
//!
//! A [`ComponentContext`] is the per-instance view: the instance name, the
//! factory context, and the effective property map.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use braze_core::{BoxError, BundleContext, Filter, Properties, ServiceArc, ServiceReference};

use crate::component::{
    BindingCallback, Callbacks, Component, FieldCallback, FieldCallbacks, LifecycleCallback,
    RegistrationCallback,
};
use crate::error::{RuntimeError, RuntimeResult};
use crate::handler::{HANDLER_PROPERTIES, HANDLER_PROVIDES, HANDLER_REQUIRES};

// ─── Requirement ──────────────────────────────────────────────────────────────

/// Declarative description of one dependency.
#[derive(Debug, Clone)]
pub struct Requirement {
    /// Specification of the required service.
    pub specification: String,
    /// Inject every matching service instead of a single one.
    pub aggregate: bool,
    /// The instance stays valid without a binding.
    pub optional: bool,
    /// Additional property filter on candidate services.
    pub filter: Option<Filter>,
    /// On departure, swap in a matching replacement without invalidating.
    pub immediate_rebind: bool,
}

impl Requirement {
    /// A mandatory, non-aggregate requirement on `specification`.
    pub fn new(specification: impl Into<String>) -> Self {
        Self {
            specification: specification.into(),
            aggregate: false,
            optional: false,
            filter: None,
            immediate_rebind: false,
        }
    }

    /// Marks the requirement as aggregate.
    pub fn aggregate(mut self) -> Self {
        self.aggregate = true;
        self
    }

    /// Marks the requirement as optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Restricts candidates with a property filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Enables immediate rebind on departure.
    pub fn immediate_rebind(mut self) -> Self {
        self.immediate_rebind = true;
        self
    }

    /// Whether `reference` satisfies this requirement.
    pub fn matches(&self, reference: &ServiceReference) -> bool {
        reference.provides(&self.specification) && reference.matches(self.filter.as_ref())
    }
}

/// One provided-service declaration: the specifications published and the
/// optional controller field gating the publication.
#[derive(Debug, Clone)]
pub struct ProvidedService {
    /// Specifications the component is published under.
    pub specifications: Vec<String>,
    /// Name of the controller flag, when the type declares one.
    pub controller: Option<String>,
}

// ─── FactoryContext ───────────────────────────────────────────────────────────

/// The sealed descriptor of a component type.
pub struct FactoryContext {
    name: String,
    properties: Properties,
    properties_fields: HashMap<String, String>,
    hidden_properties: Properties,
    provides: Vec<ProvidedService>,
    requirements: HashMap<String, Requirement>,
    callbacks: Callbacks,
    field_callbacks: HashMap<String, FieldCallbacks>,
    handler_configs: HashMap<String, Value>,
    instances: Vec<(String, Properties)>,
    is_singleton: bool,
    singleton_active: AtomicBool,
    bundle_context: Mutex<Option<Weak<dyn BundleContext>>>,
}

impl FactoryContext {
    /// Unique factory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default property values declared by the type.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Mapping from user-visible field name to property name.
    pub fn properties_fields(&self) -> &HashMap<String, String> {
        &self.properties_fields
    }

    /// Properties never exposed externally.
    pub fn hidden_properties(&self) -> &Properties {
        &self.hidden_properties
    }

    /// Provided-service declarations, in declaration order.
    pub fn provides(&self) -> &[ProvidedService] {
        &self.provides
    }

    /// Requirements, keyed by field name.
    pub fn requirements(&self) -> &HashMap<String, Requirement> {
        &self.requirements
    }

    /// Declared lifecycle callbacks.
    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Per-field binding callbacks.
    pub fn field_callbacks(&self) -> &HashMap<String, FieldCallbacks> {
        &self.field_callbacks
    }

    /// Declarative instances requested by the type, in declaration order.
    pub fn declared_instances(&self) -> &[(String, Properties)] {
        &self.instances
    }

    /// Whether the factory allows at most one live instance.
    pub fn is_singleton(&self) -> bool {
        self.is_singleton
    }

    /// Whether the singleton slot is currently occupied.
    pub fn is_singleton_active(&self) -> bool {
        self.singleton_active.load(Ordering::SeqCst)
    }

    /// Flips the singleton slot. Called by the runtime only.
    pub(crate) fn set_singleton_active(&self, active: bool) {
        self.singleton_active.store(active, Ordering::SeqCst);
    }

    /// The configuration blob attached to a handler id, if any.
    pub fn get_handler(&self, id: &str) -> Option<&Value> {
        self.handler_configs.get(id)
    }

    /// The set of handler ids this type depends on, sorted.
    pub fn get_handlers_ids(&self) -> Vec<String> {
        let ids: BTreeSet<&String> = self.handler_configs.keys().collect();
        ids.into_iter().cloned().collect()
    }

    /// Wires or clears the owning bundle. The reference is weak: the bundle
    /// outlives the factory through the framework, never through us.
    pub(crate) fn attach_bundle_context(&self, context: Option<Weak<dyn BundleContext>>) {
        *self.bundle_context.lock() = context;
    }

    /// The owning bundle's context, while the factory is registered.
    pub fn bundle_context(&self) -> Option<Arc<dyn BundleContext>> {
        self.bundle_context.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Re-opens a copy of this context as a builder, for building a child
    /// type without touching the parent. Callback closures are shared.
    pub fn to_builder(&self) -> FactoryContextBuilder {
        FactoryContextBuilder {
            name: self.name.clone(),
            properties: self.properties.clone(),
            properties_fields: self.properties_fields.clone(),
            hidden_properties: self.hidden_properties.clone(),
            provides: self.provides.clone(),
            requirements: self.requirements.clone(),
            callbacks: self.callbacks.clone(),
            field_callbacks: self.field_callbacks.clone(),
            handler_configs: self.handler_configs.clone(),
            instances: self.instances.clone(),
            is_singleton: self.is_singleton,
        }
    }
}

impl fmt::Debug for FactoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryContext")
            .field("name", &self.name)
            .field("provides", &self.provides)
            .field("requirements", &self.requirements)
            .field("handler_ids", &self.get_handlers_ids())
            .field("is_singleton", &self.is_singleton)
            .finish()
    }
}

// ─── FactoryContextBuilder ────────────────────────────────────────────────────

/// Builds a [`FactoryContext`]; `build()` seals it.
pub struct FactoryContextBuilder {
    name: String,
    properties: Properties,
    properties_fields: HashMap<String, String>,
    hidden_properties: Properties,
    provides: Vec<ProvidedService>,
    requirements: HashMap<String, Requirement>,
    callbacks: Callbacks,
    field_callbacks: HashMap<String, FieldCallbacks>,
    handler_configs: HashMap<String, Value>,
    instances: Vec<(String, Properties)>,
    is_singleton: bool,
}

impl FactoryContextBuilder {
    /// Starts a builder for the factory `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Properties::new(),
            properties_fields: HashMap::new(),
            hidden_properties: Properties::new(),
            provides: Vec::new(),
            requirements: HashMap::new(),
            callbacks: Callbacks::default(),
            field_callbacks: HashMap::new(),
            handler_configs: HashMap::new(),
            instances: Vec::new(),
            is_singleton: false,
        }
    }

    /// Constrains the factory to at most one live instance.
    pub fn singleton(mut self) -> Self {
        self.is_singleton = true;
        self
    }

    /// Declares a property with its default value, exposed under `field`.
    pub fn property(
        mut self,
        field: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        let name = name.into();
        self.properties_fields.insert(field.into(), name.clone());
        self.properties.insert(name, value.into());
        self
    }

    /// Declares a property that is never exposed externally.
    pub fn hidden_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.hidden_properties.insert(name.into(), value.into());
        self
    }

    /// Declares a provided service.
    pub fn provides(mut self, specifications: &[&str]) -> Self {
        self.provides.push(ProvidedService {
            specifications: specifications.iter().map(|s| s.to_string()).collect(),
            controller: None,
        });
        self
    }

    /// Declares a provided service gated by a controller field.
    pub fn provides_with_controller(
        mut self,
        specifications: &[&str],
        controller: impl Into<String>,
    ) -> Self {
        self.provides.push(ProvidedService {
            specifications: specifications.iter().map(|s| s.to_string()).collect(),
            controller: Some(controller.into()),
        });
        self
    }

    /// Declares a requirement injected under `field`.
    pub fn requires(mut self, field: impl Into<String>, requirement: Requirement) -> Self {
        self.requirements.insert(field.into(), requirement);
        self
    }

    /// Sets the VALIDATE callback.
    pub fn on_validate<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut dyn Component, &ComponentContext) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.validate = Some(Arc::new(callback) as LifecycleCallback);
        self
    }

    /// Sets the INVALIDATE callback.
    pub fn on_invalidate<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut dyn Component, &ComponentContext) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.invalidate = Some(Arc::new(callback) as LifecycleCallback);
        self
    }

    /// Sets the global BIND callback.
    pub fn on_bind<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut dyn Component, &ServiceArc, &ServiceReference) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.bind = Some(Arc::new(callback) as BindingCallback);
        self
    }

    /// Sets the global UPDATE callback.
    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut dyn Component, &ServiceArc, &ServiceReference) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.update = Some(Arc::new(callback) as BindingCallback);
        self
    }

    /// Sets the global UNBIND callback.
    pub fn on_unbind<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut dyn Component, &ServiceArc, &ServiceReference) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.unbind = Some(Arc::new(callback) as BindingCallback);
        self
    }

    /// Sets the POST_REGISTRATION callback.
    pub fn on_post_registration<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut dyn Component, &ServiceReference) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.post_registration = Some(Arc::new(callback) as RegistrationCallback);
        self
    }

    /// Sets the POST_UNREGISTRATION callback.
    pub fn on_post_unregistration<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut dyn Component, &ServiceReference) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.post_unregistration = Some(Arc::new(callback) as RegistrationCallback);
        self
    }

    fn field_callback<F>(callback: F, if_valid: bool) -> FieldCallback
    where
        F: Fn(&mut dyn Component, &ServiceArc, &ServiceReference) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        FieldCallback {
            callback: Arc::new(callback) as BindingCallback,
            if_valid,
        }
    }

    /// Sets the per-field BIND callback for `field`.
    pub fn on_field_bind<F>(mut self, field: impl Into<String>, if_valid: bool, callback: F) -> Self
    where
        F: Fn(&mut dyn Component, &ServiceArc, &ServiceReference) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.field_callbacks.entry(field.into()).or_default().bind =
            Some(Self::field_callback(callback, if_valid));
        self
    }

    /// Sets the per-field UPDATE callback for `field`.
    pub fn on_field_update<F>(
        mut self,
        field: impl Into<String>,
        if_valid: bool,
        callback: F,
    ) -> Self
    where
        F: Fn(&mut dyn Component, &ServiceArc, &ServiceReference) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.field_callbacks.entry(field.into()).or_default().update =
            Some(Self::field_callback(callback, if_valid));
        self
    }

    /// Sets the per-field UNBIND callback for `field`.
    pub fn on_field_unbind<F>(
        mut self,
        field: impl Into<String>,
        if_valid: bool,
        callback: F,
    ) -> Self
    where
        F: Fn(&mut dyn Component, &ServiceArc, &ServiceReference) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.field_callbacks.entry(field.into()).or_default().unbind =
            Some(Self::field_callback(callback, if_valid));
        self
    }

    /// Attaches a custom handler configuration blob.
    pub fn handler(mut self, id: impl Into<String>, config: Value) -> Self {
        self.handler_configs.insert(id.into(), config);
        self
    }

    /// Attaches a handler configuration only when the id has none yet.
    pub fn handler_default(mut self, id: impl Into<String>, default: Value) -> Self {
        self.handler_configs.entry(id.into()).or_insert(default);
        self
    }

    /// Records a declarative instantiation request.
    ///
    /// Fails with [`RuntimeError::DuplicateInstance`] when `name` was
    /// already declared on this builder.
    pub fn instance(mut self, name: impl Into<String>, properties: Properties) -> RuntimeResult<Self> {
        let name = name.into();
        if self.instances.iter().any(|(n, _)| *n == name) {
            return Err(RuntimeError::DuplicateInstance(name));
        }
        self.instances.push((name, properties));
        Ok(self)
    }

    /// Inherits configuration from a parent context, skipping the handler
    /// ids in `excluded` and never overwriting entries this builder already
    /// set. Declarative instances are not inherited.
    pub fn inherit(mut self, parent: &FactoryContext, excluded: &[&str]) -> Self {
        let skip = |id: &str| excluded.contains(&id);

        if !skip(HANDLER_PROPERTIES) {
            for (field, property) in &parent.properties_fields {
                self.properties_fields
                    .entry(field.clone())
                    .or_insert_with(|| property.clone());
            }
            for (name, value) in &parent.properties {
                self.properties
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
            for (name, value) in &parent.hidden_properties {
                self.hidden_properties
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        if !skip(HANDLER_PROVIDES) {
            for provided in &parent.provides {
                let known = self
                    .provides
                    .iter()
                    .any(|p| p.specifications == provided.specifications);
                if !known {
                    self.provides.push(provided.clone());
                }
            }
        }

        if !skip(HANDLER_REQUIRES) {
            for (field, requirement) in &parent.requirements {
                self.requirements
                    .entry(field.clone())
                    .or_insert_with(|| requirement.clone());
            }
        }

        for (id, config) in &parent.handler_configs {
            if skip(id) {
                continue;
            }
            self.handler_configs
                .entry(id.clone())
                .or_insert_with(|| config.clone());
        }

        self.callbacks.inherit(&parent.callbacks);
        for (field, parent_fcs) in &parent.field_callbacks {
            self.field_callbacks
                .entry(field.clone())
                .or_default()
                .inherit(parent_fcs);
        }

        self
    }

    /// Seals the context.
    ///
    /// The built-in handler ids are attached for every concern the type
    /// declares, so [`FactoryContext::get_handlers_ids`] names exactly the
    /// handler factories the runtime must resolve.
    pub fn build(mut self) -> RuntimeResult<FactoryContext> {
        if self.name.is_empty() {
            return Err(RuntimeError::InvalidName(self.name));
        }

        if !self.properties_fields.is_empty() {
            self.handler_configs
                .entry(HANDLER_PROPERTIES.to_string())
                .or_insert(Value::Null);
        }
        if !self.provides.is_empty() {
            self.handler_configs
                .entry(HANDLER_PROVIDES.to_string())
                .or_insert(Value::Null);
        }
        if !self.requirements.is_empty() {
            self.handler_configs
                .entry(HANDLER_REQUIRES.to_string())
                .or_insert(Value::Null);
        }

        Ok(FactoryContext {
            name: self.name,
            properties: self.properties,
            properties_fields: self.properties_fields,
            hidden_properties: self.hidden_properties,
            provides: self.provides,
            requirements: self.requirements,
            callbacks: self.callbacks,
            field_callbacks: self.field_callbacks,
            handler_configs: self.handler_configs,
            instances: self.instances,
            is_singleton: self.is_singleton,
            singleton_active: AtomicBool::new(false),
            bundle_context: Mutex::new(None),
        })
    }
}

// ─── ComponentContext ─────────────────────────────────────────────────────────

/// Per-instance runtime context.
///
/// The property map merges the factory defaults, the hidden properties, and
/// the caller-provided values (caller wins). Handlers may replace values
/// through [`set_property`](Self::set_property); the map itself is never
/// restructured from that path.
pub struct ComponentContext {
    factory: Arc<FactoryContext>,
    name: String,
    properties: Mutex<Properties>,
}

impl ComponentContext {
    /// Builds the context for instance `name`, merging `given` over the
    /// factory defaults.
    pub fn new(factory: Arc<FactoryContext>, name: impl Into<String>, given: Properties) -> Self {
        let mut properties = factory.properties().clone();
        for (key, value) in factory.hidden_properties() {
            properties.insert(key.clone(), value.clone());
        }
        properties.extend(given);
        Self {
            factory,
            name: name.into(),
            properties: Mutex::new(properties),
        }
    }

    /// The factory context of this instance's type.
    pub fn factory_context(&self) -> &Arc<FactoryContext> {
        &self.factory
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the effective properties.
    pub fn properties(&self) -> Properties {
        self.properties.lock().clone()
    }

    /// One property value, cloned.
    pub fn get_property(&self, key: &str) -> Option<Value> {
        self.properties.lock().get(key).cloned()
    }

    /// Replaces the value of an existing property; returns the previous
    /// value, or `None` (without inserting) when the key is not declared.
    pub fn set_property(&self, key: &str, value: Value) -> Option<Value> {
        let mut properties = self.properties.lock();
        match properties.get_mut(key) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => None,
        }
    }

    /// Merges a property update batch. Used by the erroneous-retry path.
    pub(crate) fn update_properties(&self, updates: &Properties) {
        let mut properties = self.properties.lock();
        for (key, value) in updates {
            properties.insert(key.clone(), value.clone());
        }
    }

    /// The effective properties minus the hidden ones.
    pub fn visible_properties(&self) -> Properties {
        let hidden = self.factory.hidden_properties();
        self.properties
            .lock()
            .iter()
            .filter(|(key, _)| !hidden.contains_key(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentContext")
            .field("name", &self.name)
            .field("factory", &self.factory.name())
            .finish()
    }
}
