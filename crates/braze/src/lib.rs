//! # Braze
//!
//! A service-component runtime in the OSGi tradition: component
//! factories declare the services they provide, the services they require,
//! and their lifecycle callbacks; the runtime matches requirements against
//! a service registry, injects dependencies through pluggable handlers,
//! drives each instance through its lifecycle, and reacts to the dynamic
//! arrival and departure of services, handlers, and bundles.
//!
//! This crate re-exports the three layers:
//!
//! - [`braze_core`]: the framework contracts (services, bundles, contexts).
//! - [`braze_framework`]: an in-memory framework implementing them.
//! - [`braze_runtime`]: the component runtime itself.
//!
//! ## Getting started
//!
//! ```rust,ignore
//! use braze::prelude::*;
//!
//! let framework = Framework::new(Properties::new());
//! let context = framework.context();
//! let runtime = ComponentRuntime::install(context.clone())?;
//! let _handlers = register_builtin_handlers(&context)?;
//!
//! let factory = ComponentFactory::new(
//!     FactoryContextBuilder::new("hello.factory")
//!         .provides(&["hello.service"])
//!         .build()?,
//!     || Ok(Box::new(Hello::default())),
//! );
//! runtime.register_factory(&context, factory)?;
//! runtime.instantiate("hello.factory", "hello.0", None)?;
//! ```

pub use braze_core;
pub use braze_framework;
pub use braze_runtime;

/// Common imports for embedders.
pub mod prelude {
    pub use braze_core::{
        Bundle, BundleContext, BundleEvent, BundleEventKind, BundleListener, Filter, Properties,
        ServiceArc, ServiceEvent, ServiceEventKind, ServiceListener, ServiceReference,
        ServiceRegistration,
    };
    pub use braze_framework::Framework;
    pub use braze_runtime::builtin::register_builtin_handlers;
    pub use braze_runtime::{
        Component, ComponentFactory, ComponentObject, ComponentRuntime, FactoryContextBuilder,
        InstanceState, Requirement, RuntimeError, RuntimeEvent, RuntimeEventKind, RuntimeListener,
        component_object, with_component, with_component_mut,
    };
}
