//! The service-provision handler.
//!
//! One handler per `provides` declaration. The published service object is
//! the component object itself; the published properties are the
//! instance's visible properties plus its name under
//! [`PROP_INSTANCE_NAME`]. Publication is gated by the controller flag
//! when the declaration names one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error};

use braze_core::{Properties, ServiceArc, ServiceReference, ServiceRegistration};

use crate::component::ComponentObject;
use crate::context::{ComponentContext, ProvidedService};
use crate::handler::{Handler, HandlerFactory, HandlerKind};

/// Service property carrying the providing instance's name.
pub const PROP_INSTANCE_NAME: &str = "instance.name";

/// Produces one registration handler per provided service.
pub struct ProvidesHandlerFactory;

impl HandlerFactory for ProvidesHandlerFactory {
    fn get_handlers(
        &self,
        context: &Arc<ComponentContext>,
        component: &ComponentObject,
    ) -> Vec<Arc<dyn Handler>> {
        context
            .factory_context()
            .provides()
            .iter()
            .map(|provided| {
                // The controller flag starts from the matching context
                // property when the declaration names one; an absent or
                // non-boolean property leaves the service published.
                let controller = provided
                    .controller
                    .as_ref()
                    .and_then(|field| context.get_property(field))
                    .and_then(|value| value.as_bool())
                    .unwrap_or(true);
                Arc::new(ServiceRegistrationHandler {
                    provided: provided.clone(),
                    context: context.clone(),
                    component: component.clone(),
                    controller: AtomicBool::new(controller),
                    registration: Mutex::new(None),
                }) as Arc<dyn Handler>
            })
            .collect()
    }
}

struct ServiceRegistrationHandler {
    provided: ProvidedService,
    context: Arc<ComponentContext>,
    component: ComponentObject,
    controller: AtomicBool,
    registration: Mutex<Option<ServiceRegistration>>,
}

impl Handler for ServiceRegistrationHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::ServiceProvider
    }

    fn name(&self) -> &'static str {
        "ServiceRegistrationHandler"
    }

    fn register_service(&self) {
        if !self.controller.load(Ordering::SeqCst) {
            return;
        }
        if self.registration.lock().is_some() {
            return;
        }
        let Some(bundle_context) = self.context.factory_context().bundle_context() else {
            error!(
                instance = %self.context.name(),
                "Cannot publish service: the factory bundle is gone"
            );
            return;
        };

        let mut properties: Properties = self.context.visible_properties();
        properties.insert(
            PROP_INSTANCE_NAME.to_string(),
            Value::from(self.context.name()),
        );
        let specifications: Vec<&str> = self
            .provided
            .specifications
            .iter()
            .map(String::as_str)
            .collect();

        let service: ServiceArc = self.component.clone();
        match bundle_context.register_service(&specifications, service, properties) {
            Ok(registration) => {
                debug!(
                    instance = %self.context.name(),
                    specifications = ?self.provided.specifications,
                    "Service published"
                );
                *self.registration.lock() = Some(registration);
            }
            Err(e) => {
                error!(
                    instance = %self.context.name(),
                    error = %e,
                    "Error publishing provided service"
                );
            }
        }
    }

    fn unregister_service(&self) {
        if let Some(registration) = self.registration.lock().take() {
            registration.unregister();
            debug!(instance = %self.context.name(), "Service withdrawn");
        }
    }

    fn clear(&self) {
        self.unregister_service();
    }

    fn service_reference(&self) -> Option<ServiceReference> {
        self.registration
            .lock()
            .as_ref()
            .map(|registration| registration.reference().clone())
    }
}
