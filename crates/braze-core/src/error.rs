//! Error types shared by the Braze framework contracts.

use thiserror::Error;

/// Boxed error type carried by user callbacks and component constructors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the framework collaborator contract.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A service was registered without any specification.
    #[error("no specification given for service registration")]
    EmptySpecifications,

    /// The framework backing a context handle is gone.
    #[error("framework is no longer available")]
    FrameworkGone,
}

/// Result type for framework contract operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Renders an error and its source chain into a single trace string.
pub fn render_error_trace(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        out.push_str("\ncaused by: ");
        out.push_str(&source.to_string());
        current = source.source();
    }
    out
}
