//! # Braze Runtime
//!
//! The service-component runtime: instantiates, wires, validates, and
//! tears down components on top of a host service framework.
//!
//! ## Architecture
//!
//! - **Factory context** ([`FactoryContext`]): the sealed descriptor of a
//!   component type — declared properties, provided and required services,
//!   lifecycle callbacks, handler ids. Built once through
//!   [`FactoryContextBuilder`].
//! - **Handlers** ([`Handler`], [`HandlerFactory`]): instance-scoped
//!   plugins implementing all injection and publication mechanics. Handler
//!   factories are themselves services in the host registry, discovered by
//!   `handler.id`.
//! - **Stored instance** ([`StoredInstance`]): owns the user object and
//!   its handlers, and drives the INVALID → VALID → ERRONEOUS / KILLED
//!   state machine under a per-instance re-entrant lock.
//! - **Runtime** ([`ComponentRuntime`]): the factory and instance
//!   registries, the pool of components waiting for handlers, the
//!   auto-restart map, and the public API. Reacts to service events
//!   (handler churn) and bundle events (factory (re)registration).
//!
//! ## Example
//!
//! ```rust,ignore
//! use braze_runtime::{ComponentRuntime, ComponentFactory, FactoryContextBuilder, Requirement};
//!
//! let runtime = ComponentRuntime::install(framework.context())?;
//! braze_runtime::builtin::register_builtin_handlers(&framework.context())?;
//!
//! let context = FactoryContextBuilder::new("sample.factory")
//!     .requires("store", Requirement::new("sample.store"))
//!     .provides(&["sample.service"])
//!     .on_validate(|component, ctx| { /* … */ Ok(()) })
//!     .build()?;
//! let factory = ComponentFactory::new(context, || Ok(Box::new(Sample::default())));
//!
//! runtime.register_factory(&framework.context(), factory)?;
//! let object = runtime.instantiate("sample.factory", "sample.0", None)?;
//! ```

pub mod builtin;
pub mod component;
pub mod context;
pub mod error;
pub mod events;
pub mod factory;
pub mod handler;
pub mod instance;
pub mod reactor;
pub mod runtime;

pub use component::{
    BindingCallback, Callbacks, Component, ComponentObject, FieldCallback, FieldCallbacks,
    LifecycleCallback, RegistrationCallback, component_object, with_component, with_component_mut,
};
pub use context::{
    ComponentContext, FactoryContext, FactoryContextBuilder, ProvidedService, Requirement,
};
pub use error::{RuntimeError, RuntimeResult};
pub use events::{ListenerSet, RuntimeEvent, RuntimeEventKind, RuntimeListener};
pub use factory::{ComponentFactory, FactoryDetails, RequirementDetails};
pub use handler::{
    HANDLER_FACTORY_SPEC, HANDLER_PROPERTIES, HANDLER_PROVIDES, HANDLER_REQUIRES, Handler,
    HandlerFactory, HandlerFactoryService, HandlerKind, LifecycleVote, PROP_HANDLER_ID,
};
pub use instance::{DependencyDetails, InstanceDetails, InstanceState, StoredInstance};
pub use runtime::{ComponentRuntime, PROP_AUTO_RESTART, SERVICE_RUNTIME};

pub use builtin::PROP_INSTANCE_NAME;
