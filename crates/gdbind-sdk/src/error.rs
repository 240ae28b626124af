//! Error types for host ABI operations

use crate::layout::ResourceKind;

/// Result type for host ABI calls
pub type AbiResult<T> = Result<T, AbiError>;

/// Host ABI error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    /// The host does not provide a required function
    #[error("Host function unavailable: {0}")]
    MissingFunction(String),

    /// A layout table entry cannot be represented in a slot
    #[error("Unsupported layout: {kind} handles of {words} words (slots hold at most {max})")]
    UnsupportedLayout {
        /// Resource kind with the bad width
        kind: ResourceKind,
        /// Configured width
        words: usize,
        /// Slot width in words
        max: usize,
    },

    /// The host refused an operation
    #[error("Host rejected {operation}: {message}")]
    Rejected {
        /// Operation name
        operation: String,
        /// Host message
        message: String,
    },

    /// A resource kind was used where it is not supported
    #[error("{operation} does not support {kind} handles")]
    WrongKind {
        /// Operation name
        operation: &'static str,
        /// Offending kind
        kind: ResourceKind,
    },

    /// Text could not cross the boundary
    #[error("Invalid string: {0}")]
    InvalidString(String),
}

impl AbiError {
    /// Shorthand for [`AbiError::Rejected`]
    pub fn rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        AbiError::Rejected {
            operation: operation.into(),
            message: message.into(),
        }
    }
}
