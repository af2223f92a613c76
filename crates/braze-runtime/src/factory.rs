//! Component factories: a sealed factory context plus a constructor.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use braze_core::{BoxError, Bundle, Properties, ServiceArc};

use crate::component::Component;
use crate::context::FactoryContext;
use crate::error::{RuntimeError, RuntimeResult};

/// Constructor signature: a zero-argument factory for the user object.
pub type Constructor = dyn Fn() -> Result<Box<dyn Component>, BoxError> + Send + Sync;

/// A component type: its sealed [`FactoryContext`] and the constructor the
/// runtime calls on `instantiate`.
///
/// Cheap to clone; bundles attach factories to their contribution list and
/// the runtime keeps one clone per registration.
#[derive(Clone)]
pub struct ComponentFactory {
    context: Arc<FactoryContext>,
    constructor: Arc<Constructor>,
}

impl ComponentFactory {
    /// Pairs a sealed context with its constructor.
    pub fn new<F>(context: FactoryContext, constructor: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Component>, BoxError> + Send + Sync + 'static,
    {
        Self {
            context: Arc::new(context),
            constructor: Arc::new(constructor),
        }
    }

    /// The sealed factory context.
    pub fn context(&self) -> &Arc<FactoryContext> {
        &self.context
    }

    /// Calls the zero-arg constructor.
    pub(crate) fn construct(&self) -> Result<Box<dyn Component>, BoxError> {
        (self.constructor)()
    }

    /// Recovers a factory from a type-erased bundle contribution.
    pub fn from_service(service: &ServiceArc) -> RuntimeResult<Self> {
        service
            .downcast_ref::<ComponentFactory>()
            .cloned()
            .ok_or(RuntimeError::InvalidType)
    }

    /// Wraps the factory into a bundle contribution.
    pub fn into_contribution(self) -> ServiceArc {
        Arc::new(self)
    }
}

impl fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("context", &self.context)
            .finish()
    }
}

// ─── Factory introspection ────────────────────────────────────────────────────

/// One requirement, as reported by factory introspection.
#[derive(Debug, Clone)]
pub struct RequirementDetails {
    /// Field the requirement is injected under.
    pub id: String,
    /// Specification of the required service.
    pub specification: String,
    /// Whether multiple services are injected.
    pub aggregate: bool,
    /// Whether the requirement is optional.
    pub optional: bool,
    /// Rendered property filter, if any.
    pub filter: Option<String>,
}

/// Snapshot of a registered factory, as returned by
/// `ComponentRuntime::get_factory_details`.
#[derive(Debug, Clone)]
pub struct FactoryDetails {
    /// Factory name.
    pub name: String,
    /// The bundle providing the factory, while it is resolvable.
    pub bundle: Option<Bundle>,
    /// Configurable properties: property name to default value.
    pub properties: Properties,
    /// Declared requirements.
    pub requirements: Vec<RequirementDetails>,
    /// Specifications of the provided services, one list per provision.
    pub services: Vec<Vec<String>>,
    /// Custom (non-built-in) handlers: id to `(config, available)`.
    pub handlers: std::collections::HashMap<String, (Value, bool)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FactoryContextBuilder;

    #[test]
    fn contribution_round_trip() {
        let context = FactoryContextBuilder::new("factory.a")
            .build()
            .expect("sealed context");
        let factory = ComponentFactory::new(context, || Ok(Box::new(0u32) as Box<dyn Component>));

        let contribution = factory.clone().into_contribution();
        let recovered = ComponentFactory::from_service(&contribution).expect("factory");
        assert_eq!(recovered.context().name(), "factory.a");

        let not_a_factory: ServiceArc = Arc::new("something else".to_string());
        assert!(matches!(
            ComponentFactory::from_service(&not_a_factory),
            Err(RuntimeError::InvalidType)
        ));
    }
}
