//! The user-facing component object and its lifecycle callbacks.
//!
//! A component is any `Any + Send` value; the runtime owns it behind
//! [`ComponentObject`] and hands it to callbacks as `&mut dyn Component`.
//! Callbacks are plain closures attached to the factory context — the
//! runtime never requires a specific component type, it only drives the
//! closures the factory declared.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use braze_core::{BoxError, ServiceArc, ServiceReference};

use crate::context::ComponentContext;

/// A value that can live as a component instance.
///
/// Blanket-implemented for every `Any + Send` type; the accessor methods
/// exist so callbacks can downcast the trait object back to the concrete
/// component type.
pub trait Component: Any + Send {
    /// Borrow as [`Any`] for downcasting.
    fn as_any(&self) -> &dyn Any;
    /// Mutably borrow as [`Any`] for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> Component for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Shared handle to a live component instance.
///
/// Cloned freely: the instance registry, the waiting pool, provider
/// handlers (a provided service *is* the component object), and the caller
/// of `instantiate` all hold the same allocation.
pub type ComponentObject = Arc<Mutex<Box<dyn Component>>>;

/// Wraps a plain value into a [`ComponentObject`].
pub fn component_object<T: Component>(value: T) -> ComponentObject {
    Arc::new(Mutex::new(Box::new(value)))
}

/// Locks the object and runs `f` over the concrete component type.
///
/// Returns `None` when the component is not a `T`. Note that the downcast
/// goes through the boxed trait object — `object.lock().as_any()` would
/// instead see the box itself, which is never a `T`.
pub fn with_component<T: Component, R>(
    object: &ComponentObject,
    f: impl FnOnce(&T) -> R,
) -> Option<R> {
    let guard = object.lock();
    let component: &dyn Component = &**guard;
    component.as_any().downcast_ref::<T>().map(f)
}

/// Locks the object and runs `f` over the concrete component type,
/// mutably.
pub fn with_component_mut<T: Component, R>(
    object: &ComponentObject,
    f: impl FnOnce(&mut T) -> R,
) -> Option<R> {
    let mut guard = object.lock();
    let component: &mut dyn Component = &mut **guard;
    component.as_any_mut().downcast_mut::<T>().map(f)
}

// ─── Callback types ───────────────────────────────────────────────────────────

/// VALIDATE / INVALIDATE callback.
pub type LifecycleCallback =
    Arc<dyn Fn(&mut dyn Component, &ComponentContext) -> Result<(), BoxError> + Send + Sync>;

/// BIND / UPDATE / UNBIND callback, global or per-field.
pub type BindingCallback = Arc<
    dyn Fn(&mut dyn Component, &ServiceArc, &ServiceReference) -> Result<(), BoxError>
        + Send
        + Sync,
>;

/// POST_REGISTRATION / POST_UNREGISTRATION callback.
pub type RegistrationCallback =
    Arc<dyn Fn(&mut dyn Component, &ServiceReference) -> Result<(), BoxError> + Send + Sync>;

/// The declared lifecycle callbacks of a component type — at most one
/// target per callback kind.
#[derive(Clone, Default)]
pub struct Callbacks {
    /// Called before the instance becomes VALID; an error aborts validation.
    pub validate: Option<LifecycleCallback>,
    /// Called when the instance leaves VALID; errors logged and swallowed.
    pub invalidate: Option<LifecycleCallback>,
    /// Called after any dependency is bound.
    pub bind: Option<BindingCallback>,
    /// Called after any bound service's properties change.
    pub update: Option<BindingCallback>,
    /// Called after any dependency is unbound.
    pub unbind: Option<BindingCallback>,
    /// Called after each provided service is registered.
    pub post_registration: Option<RegistrationCallback>,
    /// Called before each provided service is unregistered.
    pub post_unregistration: Option<RegistrationCallback>,
}

impl Callbacks {
    /// Fills every unset slot from `parent`, leaving own entries untouched.
    pub fn inherit(&mut self, parent: &Callbacks) {
        fn fill<T: Clone>(slot: &mut Option<T>, parent: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(parent);
            }
        }
        fill(&mut self.validate, &parent.validate);
        fill(&mut self.invalidate, &parent.invalidate);
        fill(&mut self.bind, &parent.bind);
        fill(&mut self.update, &parent.update);
        fill(&mut self.unbind, &parent.unbind);
        fill(&mut self.post_registration, &parent.post_registration);
        fill(&mut self.post_unregistration, &parent.post_unregistration);
    }
}

/// One per-field binding callback, tagged with its `if_valid` gate: when
/// set, the callback only runs while the instance is VALID.
#[derive(Clone)]
pub struct FieldCallback {
    /// The callback closure.
    pub callback: BindingCallback,
    /// Only invoke while the instance is VALID.
    pub if_valid: bool,
}

/// The per-field binding callbacks declared for one injected field.
#[derive(Clone, Default)]
pub struct FieldCallbacks {
    /// Field-level BIND.
    pub bind: Option<FieldCallback>,
    /// Field-level UPDATE.
    pub update: Option<FieldCallback>,
    /// Field-level UNBIND.
    pub unbind: Option<FieldCallback>,
}

impl FieldCallbacks {
    /// Fills every unset slot from `parent`.
    pub fn inherit(&mut self, parent: &FieldCallbacks) {
        if self.bind.is_none() {
            self.bind.clone_from(&parent.bind);
        }
        if self.update.is_none() {
            self.update.clone_from(&parent.update);
        }
        if self.unbind.is_none() {
            self.unbind.clone_from(&parent.unbind);
        }
    }
}
