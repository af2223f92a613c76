//! # Braze Core
//!
//! Framework contracts for the Braze component runtime.
//!
//! This crate defines the surface between the component runtime and the
//! service framework that hosts it:
//!
//! - **Services**: [`ServiceReference`], [`ServiceRegistration`], change
//!   events and the [`ServiceListener`] interface.
//! - **Bundles**: [`Bundle`] handles, lifecycle events and the
//!   [`BundleListener`] / [`FrameworkStopListener`] interfaces.
//! - **Context**: the [`BundleContext`] capability a bundle uses to reach
//!   the registry.
//! - **Properties and filters**: [`Properties`] maps and the [`Filter`]
//!   predicate applied to them.
//!
//! The registry and bundle loader implementing these contracts live in
//! `braze-framework`; the component model built on top of them lives in
//! `braze-runtime`.

pub mod bundle;
pub mod context;
pub mod error;
pub mod filter;
pub mod properties;
pub mod service;

pub use bundle::{Bundle, BundleEvent, BundleEventKind, BundleListener, BundleState, FrameworkStopListener};
pub use context::BundleContext;
pub use error::{BoxError, CoreError, CoreResult, render_error_trace};
pub use filter::Filter;
pub use properties::{Properties, SERVICE_ID};
pub use service::{
    Registrar, ServiceArc, ServiceEvent, ServiceEventKind, ServiceListener, ServiceReference,
    ServiceRegistration,
};

use std::sync::Arc;

/// Compares two `Arc`s by the identity of the value they point to, ignoring
/// vtable metadata. Used to match listeners on removal: coercing the same
/// `Arc` to a trait object in different call sites may produce distinct fat
/// pointers, but the data pointer stays stable.
pub fn identity_eq<T: ?Sized, U: ?Sized>(a: &Arc<T>, b: &Arc<U>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Speak: Send + Sync {}
    struct Dog;
    impl Speak for Dog {}

    #[test]
    fn identity_eq_sees_through_coercion() {
        let dog = Arc::new(Dog);
        let as_trait: Arc<dyn Speak> = dog.clone();
        let other = Arc::new(Dog);

        assert!(identity_eq(&dog, &as_trait));
        assert!(!identity_eq(&dog, &other));
    }
}
