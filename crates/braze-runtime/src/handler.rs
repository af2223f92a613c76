//! The handler plugin contract.
//!
//! Handlers implement every injection and publication mechanic of the
//! runtime: dependency binding, service provision, property maintenance.
//! A handler *factory* is itself a service, advertised in the host registry
//! under [`HANDLER_FACTORY_SPEC`] with a [`PROP_HANDLER_ID`] property; the
//! runtime resolves the handler ids a factory context names against those
//! services, and produces a fresh handler set per component incarnation.

use std::sync::Arc;

use braze_core::{ServiceArc, ServiceReference};

use crate::context::{ComponentContext, Requirement};
use crate::component::ComponentObject;
use crate::instance::StoredInstance;

/// Specification under which handler factories are registered.
pub const HANDLER_FACTORY_SPEC: &str = "braze.handler.factory";

/// Service property carrying a handler factory's id.
pub const PROP_HANDLER_ID: &str = "handler.id";

/// Built-in handler id: property maintenance.
pub const HANDLER_PROPERTIES: &str = "properties";

/// Built-in handler id: service provision.
pub const HANDLER_PROVIDES: &str = "provides";

/// Built-in handler id: dependency injection.
pub const HANDLER_REQUIRES: &str = "requires";

/// Functional role of a handler; inspection APIs filter on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Publishes services on behalf of the instance.
    ServiceProvider,
    /// Injects required services into the instance.
    Dependency,
    /// Maintains instance properties.
    Properties,
}

/// A handler's opinion on whether its instance may be valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleVote {
    /// The handler's concern is satisfied.
    Valid,
    /// The handler's concern is unsatisfied; the instance must not be VALID.
    Invalid,
    /// No opinion; never blocks validation.
    Abstain,
}

/// An instance-scoped lifecycle plugin.
///
/// All methods have no-op defaults; a handler implements the capabilities
/// it participates in. Methods are invoked under the instance lock — a
/// handler calling back into its [`StoredInstance`] re-enters that lock on
/// the same thread, which the instance supports.
pub trait Handler: Send + Sync {
    /// The handler's functional role.
    fn kind(&self) -> HandlerKind;

    /// Short type name, surfaced by introspection.
    fn name(&self) -> &'static str {
        "handler"
    }

    /// Wires the handler to its stored instance. Called once, right after
    /// the instance is created and before `start`.
    fn manipulate(&self, _instance: &Arc<StoredInstance>) {}

    /// The instance is starting; acquire external resources (listeners).
    fn start(&self) {}

    /// The instance is being killed; release external resources.
    fn stop(&self) {}

    /// Final cleanup after `stop`; drop every reference.
    fn clear(&self) {}

    /// Votes on the instance lifecycle.
    fn check_lifecycle(&self) -> LifecycleVote {
        LifecycleVote::Abstain
    }

    /// Binds whatever currently matches in the registry. Dependency
    /// handlers notify the instance for each binding made.
    fn update_bindings(&self) {}

    /// The instance became VALID.
    fn on_validated(&self) {}

    /// The instance left VALID.
    fn on_invalidated(&self) {}

    /// Publishes the provided service, for provider handlers.
    fn register_service(&self) {}

    /// Withdraws the provided service, for provider handlers.
    fn unregister_service(&self) {}

    /// The published service reference, for provider handlers.
    fn service_reference(&self) -> Option<ServiceReference> {
        None
    }

    /// Current bindings, for dependency handlers.
    fn bindings(&self) -> Vec<ServiceReference> {
        Vec::new()
    }

    /// The injected field name, for dependency handlers.
    fn field(&self) -> Option<String> {
        None
    }

    /// The requirement served, for dependency handlers.
    fn requirement(&self) -> Option<Requirement> {
        None
    }
}

/// Produces handlers for component instances.
///
/// A new handler set is produced per `(component, incarnation)`; handlers
/// are never shared between instances.
pub trait HandlerFactory: Send + Sync {
    /// Returns zero or more handlers bound to the given instance.
    fn get_handlers(
        &self,
        context: &Arc<ComponentContext>,
        component: &ComponentObject,
    ) -> Vec<Arc<dyn Handler>>;
}

/// The concrete service object a handler factory is registered as.
///
/// Registering the trait object behind a concrete wrapper lets the runtime
/// downcast it back out of the type-erased registry.
pub struct HandlerFactoryService(Arc<dyn HandlerFactory>);

impl HandlerFactoryService {
    /// Wraps a handler factory for registration.
    pub fn new(factory: Arc<dyn HandlerFactory>) -> Self {
        Self(factory)
    }

    /// Wraps a handler factory into a ready-to-register service object.
    pub fn into_service(factory: Arc<dyn HandlerFactory>) -> ServiceArc {
        Arc::new(Self(factory))
    }

    /// The wrapped factory.
    pub fn factory(&self) -> Arc<dyn HandlerFactory> {
        self.0.clone()
    }
}
