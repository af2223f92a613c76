//! # Braze Framework
//!
//! A minimal in-memory implementation of the Braze framework contracts:
//! a service registry with filter matching and synchronous listener
//! dispatch, and a bundle host that fires lifecycle events.
//!
//! The component runtime (`braze-runtime`) only depends on the contracts in
//! `braze-core`; this crate is the host used by embedders, demos, and the
//! runtime's own tests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use braze_framework::Framework;
//!
//! let framework = Framework::new(Properties::new());
//! let context = framework.context();
//! let registration = context.register_service(&["spec.echo"], service, props)?;
//! // …
//! registration.unregister();
//! ```

pub mod framework;
pub mod registry;

pub use framework::Framework;
pub use registry::ServiceRegistry;
