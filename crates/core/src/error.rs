//! Model error type.

use thiserror::Error;

/// Result type used across the model layer.
pub type ModelResult<T> = Result<T, ModelError>;

/// Model-level error.
///
/// Deterministic failures only (parsing, classification). Storage and network
/// concerns have their own error types in `waybill-client`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The HTTP method is not one the client knows about.
    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    /// A read-only method was handed to something that only accepts mutations.
    #[error("method {0} is not a mutation")]
    NotMutating(String),

    /// An identifier was malformed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl ModelError {
    pub fn unsupported_method(method: impl Into<String>) -> Self {
        Self::UnsupportedMethod(method.into())
    }

    pub fn not_mutating(method: impl Into<String>) -> Self {
        Self::NotMutating(method.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
