//! The in-memory framework: bundles, contexts, and lifecycle events.
//!
//! [`Framework`] owns the service registry, the bundle table, and the
//! bundle/framework-stop listener lists. It mints one [`BundleContext`]
//! per bundle and keeps it alive for the bundle's lifetime, so weak
//! back-references held by consumers stay upgradable.
//!
//! Bundle updates replay the full event sequence of a real reload:
//! UPDATE_BEGIN → STOPPING_PRECLEAN → STARTING → UPDATED, or
//! UPDATE_BEGIN → UPDATE_FAILED when the new revision cannot start.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

use braze_core::{
    Bundle, BundleContext, BundleEvent, BundleEventKind, BundleListener, BundleState, CoreError,
    CoreResult, Filter, FrameworkStopListener, Properties, ServiceArc, ServiceListener,
    ServiceReference, ServiceRegistration, identity_eq,
};

use crate::registry::ServiceRegistry;

struct FrameworkState {
    bundles: HashMap<u64, Bundle>,
    contexts: HashMap<u64, Arc<FrameworkBundleContext>>,
    bundle_listeners: Vec<Arc<dyn BundleListener>>,
    stop_listeners: Vec<Arc<dyn FrameworkStopListener>>,
}

struct FrameworkInner {
    properties: Properties,
    registry: Arc<ServiceRegistry>,
    state: Mutex<FrameworkState>,
    next_bundle_id: AtomicU64,
}

/// An in-memory service framework.
#[derive(Clone)]
pub struct Framework {
    inner: Arc<FrameworkInner>,
}

impl Framework {
    /// Creates a framework with the given framework-wide properties.
    ///
    /// The framework itself appears as bundle 0, already active.
    pub fn new(properties: Properties) -> Self {
        let inner = Arc::new(FrameworkInner {
            properties,
            registry: ServiceRegistry::new(),
            state: Mutex::new(FrameworkState {
                bundles: HashMap::new(),
                contexts: HashMap::new(),
                bundle_listeners: Vec::new(),
                stop_listeners: Vec::new(),
            }),
            next_bundle_id: AtomicU64::new(1),
        });

        let framework = Self { inner };
        let bundle = Bundle::new(0, "framework");
        bundle.set_state(BundleState::Active);
        framework.adopt(bundle);
        framework
    }

    fn adopt(&self, bundle: Bundle) {
        let context = Arc::new(FrameworkBundleContext {
            bundle: bundle.clone(),
            framework: Arc::downgrade(&self.inner),
        });
        let as_trait: Arc<dyn BundleContext> = context.clone();
        bundle.attach_context(Arc::downgrade(&as_trait));

        let mut state = self.inner.state.lock();
        state.bundles.insert(bundle.id(), bundle.clone());
        state.contexts.insert(bundle.id(), context);
    }

    /// The framework bundle's context.
    pub fn context(&self) -> Arc<dyn BundleContext> {
        let state = self.inner.state.lock();
        state.contexts.get(&0).cloned().expect("framework bundle context")
    }

    /// Direct access to the service registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.inner.registry
    }

    /// Installs a new bundle in [`BundleState::Installed`].
    pub fn install_bundle(&self, name: impl Into<String>) -> Bundle {
        let id = self.inner.next_bundle_id.fetch_add(1, Ordering::Relaxed);
        let bundle = Bundle::new(id, name);
        self.adopt(bundle.clone());
        info!(bundle = id, name = %bundle.name(), "Bundle installed");
        bundle
    }

    /// Starts a bundle: marks it active and fires STARTING.
    pub fn start_bundle(&self, bundle: &Bundle) {
        bundle.set_state(BundleState::Active);
        self.fire_bundle_event(BundleEventKind::Starting, bundle);
    }

    /// Stops a bundle: fires STOPPING_PRECLEAN and marks it installed.
    pub fn stop_bundle(&self, bundle: &Bundle) {
        bundle.set_state(BundleState::Stopping);
        self.fire_bundle_event(BundleEventKind::StoppingPreclean, bundle);
        bundle.set_state(BundleState::Installed);
    }

    /// Updates a bundle, replaying the reload event sequence.
    pub fn update_bundle(&self, bundle: &Bundle) {
        self.fire_bundle_event(BundleEventKind::UpdateBegin, bundle);
        self.stop_bundle(bundle);
        self.start_bundle(bundle);
        self.fire_bundle_event(BundleEventKind::Updated, bundle);
    }

    /// Aborts a bundle update: UPDATE_BEGIN immediately followed by
    /// UPDATE_FAILED, the old revision staying live.
    pub fn fail_update_bundle(&self, bundle: &Bundle) {
        self.fire_bundle_event(BundleEventKind::UpdateBegin, bundle);
        self.fire_bundle_event(BundleEventKind::UpdateFailed, bundle);
    }

    /// Stops the framework: notifies every framework-stop listener.
    pub fn stop(&self) {
        let listeners = {
            let state = self.inner.state.lock();
            state.stop_listeners.clone()
        };
        info!("Framework stopping");
        for listener in listeners {
            listener.framework_stopping();
        }
    }

    fn fire_bundle_event(&self, kind: BundleEventKind, bundle: &Bundle) {
        let listeners = {
            let state = self.inner.state.lock();
            state.bundle_listeners.clone()
        };
        let event = BundleEvent {
            kind,
            bundle: bundle.clone(),
        };
        for listener in listeners {
            listener.bundle_changed(&event);
        }
    }
}

// ─── Per-bundle context ───────────────────────────────────────────────────────

struct FrameworkBundleContext {
    bundle: Bundle,
    framework: Weak<FrameworkInner>,
}

impl FrameworkBundleContext {
    fn framework(&self) -> Option<Arc<FrameworkInner>> {
        self.framework.upgrade()
    }
}

impl BundleContext for FrameworkBundleContext {
    fn bundle(&self) -> Bundle {
        self.bundle.clone()
    }

    fn bundles(&self) -> Vec<Bundle> {
        let Some(framework) = self.framework() else {
            return Vec::new();
        };
        let state = framework.state.lock();
        let mut bundles: Vec<Bundle> = state.bundles.values().cloned().collect();
        bundles.sort_by_key(Bundle::id);
        bundles
    }

    fn framework_property(&self, key: &str) -> Option<Value> {
        self.framework()?.properties.get(key).cloned()
    }

    fn register_service(
        &self,
        specifications: &[&str],
        service: ServiceArc,
        properties: Properties,
    ) -> CoreResult<ServiceRegistration> {
        let framework = self.framework().ok_or(CoreError::FrameworkGone)?;
        framework.registry.register(specifications, service, properties)
    }

    fn get_service(&self, reference: &ServiceReference) -> Option<ServiceArc> {
        self.framework()?.registry.get_service(reference)
    }

    fn unget_service(&self, reference: &ServiceReference) {
        if let Some(framework) = self.framework() {
            framework.registry.unget_service(reference);
        }
    }

    fn get_service_reference(
        &self,
        specification: &str,
        filter: Option<&Filter>,
    ) -> Option<ServiceReference> {
        self.framework()?.registry.get_reference(specification, filter)
    }

    fn get_all_service_references(&self, specification: &str) -> Vec<ServiceReference> {
        self.framework()
            .map(|f| f.registry.get_references(specification))
            .unwrap_or_default()
    }

    fn add_service_listener(
        &self,
        listener: Arc<dyn ServiceListener>,
        specification: Option<&str>,
        filter: Option<Filter>,
    ) {
        if let Some(framework) = self.framework() {
            framework.registry.add_listener(listener, specification, filter);
        }
    }

    fn remove_service_listener(&self, listener: &Arc<dyn ServiceListener>) {
        if let Some(framework) = self.framework() {
            framework.registry.remove_listener(listener);
        }
    }

    fn add_bundle_listener(&self, listener: Arc<dyn BundleListener>) {
        if let Some(framework) = self.framework() {
            let mut state = framework.state.lock();
            if !state
                .bundle_listeners
                .iter()
                .any(|l| identity_eq(l, &listener))
            {
                state.bundle_listeners.push(listener);
            }
        }
    }

    fn remove_bundle_listener(&self, listener: &Arc<dyn BundleListener>) {
        if let Some(framework) = self.framework() {
            let mut state = framework.state.lock();
            state.bundle_listeners.retain(|l| !identity_eq(l, listener));
        }
    }

    fn add_framework_stop_listener(&self, listener: Arc<dyn FrameworkStopListener>) {
        if let Some(framework) = self.framework() {
            let mut state = framework.state.lock();
            if !state.stop_listeners.iter().any(|l| identity_eq(l, &listener)) {
                state.stop_listeners.push(listener);
            }
        }
    }

    fn remove_framework_stop_listener(&self, listener: &Arc<dyn FrameworkStopListener>) {
        if let Some(framework) = self.framework() {
            let mut state = framework.state.lock();
            state.stop_listeners.retain(|l| !identity_eq(l, listener));
        }
    }
}
