//! The bundle context — the capability through which code interacts with
//! the framework that hosts it.

use std::sync::Arc;

use serde_json::Value;

use crate::bundle::{Bundle, BundleListener, FrameworkStopListener};
use crate::error::CoreResult;
use crate::filter::Filter;
use crate::properties::Properties;
use crate::service::{ServiceArc, ServiceListener, ServiceReference, ServiceRegistration};

/// Per-bundle view of the framework.
///
/// Every operation is callable from any thread. Listener registration is
/// identity-based: removal compares the `Arc` data pointer (see
/// [`identity_eq`](crate::identity_eq)), so the same `Arc` must be passed to
/// add and remove.
pub trait BundleContext: Send + Sync {
    /// The bundle this context belongs to.
    fn bundle(&self) -> Bundle;

    /// All bundles currently installed in the framework.
    fn bundles(&self) -> Vec<Bundle>;

    /// Reads a framework-wide property.
    fn framework_property(&self, key: &str) -> Option<Value>;

    /// Registers a service under the given specifications.
    fn register_service(
        &self,
        specifications: &[&str],
        service: ServiceArc,
        properties: Properties,
    ) -> CoreResult<ServiceRegistration>;

    /// Fetches the service object behind a reference, recording the usage.
    fn get_service(&self, reference: &ServiceReference) -> Option<ServiceArc>;

    /// Releases one usage of the service.
    fn unget_service(&self, reference: &ServiceReference);

    /// Returns the matching reference with the lowest service id, if any.
    fn get_service_reference(
        &self,
        specification: &str,
        filter: Option<&Filter>,
    ) -> Option<ServiceReference>;

    /// Returns all references registered under the specification, ordered by
    /// ascending service id.
    fn get_all_service_references(&self, specification: &str) -> Vec<ServiceReference>;

    /// Subscribes to service events, optionally scoped to one specification
    /// and filtered on service properties.
    fn add_service_listener(
        &self,
        listener: Arc<dyn ServiceListener>,
        specification: Option<&str>,
        filter: Option<Filter>,
    );

    /// Unsubscribes a service listener.
    fn remove_service_listener(&self, listener: &Arc<dyn ServiceListener>);

    /// Subscribes to bundle lifecycle events.
    fn add_bundle_listener(&self, listener: Arc<dyn BundleListener>);

    /// Unsubscribes a bundle listener.
    fn remove_bundle_listener(&self, listener: &Arc<dyn BundleListener>);

    /// Subscribes to the framework stop notification.
    fn add_framework_stop_listener(&self, listener: Arc<dyn FrameworkStopListener>);

    /// Unsubscribes a framework stop listener.
    fn remove_framework_stop_listener(&self, listener: &Arc<dyn FrameworkStopListener>);
}
