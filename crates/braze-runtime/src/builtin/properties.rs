//! The property-maintenance handler.
//!
//! The effective property store lives in the component context; this
//! handler only claims the concern so types declaring property fields
//! resolve their `properties` handler id. It never blocks validation.

use std::sync::Arc;

use crate::component::ComponentObject;
use crate::context::ComponentContext;
use crate::handler::{Handler, HandlerFactory, HandlerKind};

/// Produces the property-maintenance handler.
pub struct PropertiesHandlerFactory;

impl HandlerFactory for PropertiesHandlerFactory {
    fn get_handlers(
        &self,
        context: &Arc<ComponentContext>,
        _component: &ComponentObject,
    ) -> Vec<Arc<dyn Handler>> {
        if context.factory_context().properties_fields().is_empty() {
            return Vec::new();
        }
        vec![Arc::new(PropertiesHandler)]
    }
}

struct PropertiesHandler;

impl Handler for PropertiesHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Properties
    }

    fn name(&self) -> &'static str {
        "PropertiesHandler"
    }
}
