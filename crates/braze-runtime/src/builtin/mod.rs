//! Built-in handler factories.
//!
//! The runtime itself treats handlers as opaque plugins; these three cover
//! the concerns every component model needs — property maintenance,
//! service provision, dependency injection — and are registered as regular
//! handler factory services, so embedders can replace any of them.

mod properties;
mod provides;
mod requires;

pub use properties::PropertiesHandlerFactory;
pub use provides::{PROP_INSTANCE_NAME, ProvidesHandlerFactory};
pub use requires::RequiresHandlerFactory;

use std::sync::Arc;

use serde_json::Value;

use braze_core::{BundleContext, CoreResult, Properties, ServiceRegistration};

use crate::handler::{
    HANDLER_FACTORY_SPEC, HANDLER_PROPERTIES, HANDLER_PROVIDES, HANDLER_REQUIRES, HandlerFactory,
    HandlerFactoryService, PROP_HANDLER_ID,
};

/// Registers the three built-in handler factories on the given context.
///
/// Returns the registrations in `(properties, provides, requires)` order;
/// unregistering one makes the runtime queue every component that depends
/// on the corresponding handler id.
pub fn register_builtin_handlers(
    context: &Arc<dyn BundleContext>,
) -> CoreResult<Vec<ServiceRegistration>> {
    let factories: [(&str, Arc<dyn HandlerFactory>); 3] = [
        (HANDLER_PROPERTIES, Arc::new(PropertiesHandlerFactory)),
        (HANDLER_PROVIDES, Arc::new(ProvidesHandlerFactory)),
        (HANDLER_REQUIRES, Arc::new(RequiresHandlerFactory)),
    ];

    let mut registrations = Vec::with_capacity(factories.len());
    for (id, factory) in factories {
        let mut properties = Properties::new();
        properties.insert(PROP_HANDLER_ID.to_string(), Value::from(id));
        registrations.push(context.register_service(
            &[HANDLER_FACTORY_SPEC],
            HandlerFactoryService::into_service(factory),
            properties,
        )?);
    }
    Ok(registrations)
}
