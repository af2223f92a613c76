//! The bundle reactor: maps bundle lifecycle events to runtime actions.
//!
//! - STARTING registers the factories the bundle contributed and issues
//!   the declarative instantiations, before the bundle's own activation
//!   logic runs — so that logic can already use the factories.
//! - STOPPING_PRECLEAN unregisters the bundle's factories after its own
//!   deactivation logic ran, letting it kill components explicitly first.
//! - UPDATE_BEGIN snapshots the bundle's live instances carrying
//!   [`PROP_AUTO_RESTART`]; UPDATED replays the snapshot; UPDATE_FAILED
//!   discards it.

use braze_core::properties::flag;
use braze_core::{Bundle, BundleEvent, BundleEventKind, BundleListener, Properties};

use tracing::{error, warn};

use crate::factory::ComponentFactory;
use crate::runtime::{ComponentRuntime, PROP_AUTO_RESTART};

impl BundleListener for ComponentRuntime {
    fn bundle_changed(&self, event: &BundleEvent) {
        match event.kind {
            BundleEventKind::Starting => self.register_bundle_factories(&event.bundle),
            BundleEventKind::StoppingPreclean => self.unregister_bundle_factories(&event.bundle),
            BundleEventKind::UpdateBegin => self.autorestart_store_components(&event.bundle),
            BundleEventKind::Updated => self.autorestart_components(&event.bundle),
            BundleEventKind::UpdateFailed => {
                let _ = self.take_auto_restart(event.bundle.id());
            }
        }
    }
}

impl ComponentRuntime {
    /// Registers every component factory the bundle contributed, then
    /// instantiates the declarative instances of each. Contributions that
    /// are not component factories are skipped; failures are logged and do
    /// not abort the loop.
    pub(crate) fn register_bundle_factories(&self, bundle: &Bundle) {
        let Some(context) = bundle.context() else {
            warn!(bundle = bundle.id(), "Starting bundle has no context");
            return;
        };

        for contribution in bundle.contributions() {
            let Ok(factory) = ComponentFactory::from_service(&contribution) else {
                continue;
            };
            let factory_name = factory.context().name().to_string();
            let declared = factory.context().declared_instances().to_vec();

            if let Err(e) = self.register_factory(&context, factory) {
                error!(
                    factory = %factory_name,
                    bundle = bundle.id(),
                    error = %e,
                    "Cannot register factory of bundle"
                );
                continue;
            }
            for (name, properties) in declared {
                if let Err(e) = self.instantiate(&factory_name, &name, Some(properties)) {
                    error!(
                        instance = %name,
                        factory = %factory_name,
                        error = %e,
                        "Error instantiating declared component"
                    );
                }
            }
        }
    }

    /// Unregisters every factory owned by the bundle.
    fn unregister_bundle_factories(&self, bundle: &Bundle) {
        for name in self.get_factories() {
            let owner = self.get_factory_bundle(&name).ok();
            if owner.is_some_and(|b| b.id() == bundle.id()) {
                self.unregister_factory(&name);
            }
        }
    }

    /// Snapshots the bundle's live instances whose properties carry
    /// [`PROP_AUTO_RESTART`], with a deep copy of their current properties.
    fn autorestart_store_components(&self, bundle: &Bundle) {
        let mut entries: Vec<(String, String, Properties)> = Vec::new();
        for stored in self.live_instances() {
            let owner = self.get_factory_bundle(stored.factory_name()).ok();
            if !owner.is_some_and(|b| b.id() == bundle.id()) {
                continue;
            }
            let properties = stored.context().properties();
            if flag(&properties, PROP_AUTO_RESTART) {
                entries.push((
                    stored.factory_name().to_string(),
                    stored.name().to_string(),
                    properties,
                ));
            }
        }
        self.store_auto_restart(bundle.id(), entries);
    }

    /// Replays the auto-restart snapshot of the bundle; failures are
    /// logged and do not abort the loop. The snapshot is cleared.
    fn autorestart_components(&self, bundle: &Bundle) {
        for (factory, name, properties) in self.take_auto_restart(bundle.id()) {
            if let Err(e) = self.instantiate(&factory, &name, Some(properties)) {
                error!(
                    instance = %name,
                    factory = %factory,
                    bundle = bundle.id(),
                    error = %e,
                    "Error restarting component"
                );
            }
        }
    }
}
