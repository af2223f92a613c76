//! Error types for the component runtime.
//!
//! The taxonomy separates caller contract violations (surfaced to the
//! caller), internal failures (captured into instance state as an error
//! trace), and listener/informational callback failures (logged and
//! swallowed, never propagated).

use thiserror::Error;

use braze_core::CoreError;

/// Errors surfaced by the public runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A factory or instance name was empty.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// A value passed as a factory does not carry a sealed factory context.
    #[error("not a component factory")]
    InvalidType,

    /// A factory with that name is already registered.
    #[error("factory '{0}' already exists")]
    DuplicateFactory(String),

    /// An instance with that name is already running or waiting.
    #[error("'{0}' is an already running instance name")]
    DuplicateInstance(String),

    /// The factory is a singleton and already has a live instance.
    #[error("'{factory}' is a singleton: '{name}' cannot be instantiated")]
    SingletonActive {
        /// The singleton factory.
        factory: String,
        /// The rejected instance name.
        name: String,
    },

    /// No factory registered under that name.
    #[error("unknown factory '{0}'")]
    UnknownFactory(String),

    /// No instance registered under that name.
    #[error("unknown component instance '{0}'")]
    UnknownInstance(String),

    /// The component constructor returned an error.
    #[error("factory '{factory}' failed to create '{name}': {message}")]
    FactoryRaised {
        /// The failing factory.
        factory: String,
        /// The instance name that was requested.
        name: String,
        /// Rendered constructor error.
        message: String,
    },

    /// `instantiate` was called while the runtime is shutting down.
    #[error("the runtime is stopping")]
    RuntimeStopping,

    /// A framework contract operation failed.
    #[error(transparent)]
    Framework(#[from] CoreError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
