use thiserror::Error;

use crate::autograd::NodeId;

/// Main error type for the kiln engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KilnError {
    /// Shape-related errors with detailed suggestions
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Operation errors with context
    #[error("Operation error: {operation} - {message}")]
    OperationError {
        operation: String,
        message: String,
    },

    /// A backward root already carries a gradient and an explicit one was supplied too
    #[error("Conflicting gradient seed on node {node}: the node already has a gradient")]
    ConflictingGradientSeed { node: NodeId },

    /// The node was released and its value or function is gone
    #[error("Node {node} has been released")]
    NodeReleased { node: NodeId },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),
}

impl KilnError {
    /// Create a shape error with helpful suggestions
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = if let Some(sugg) = suggestion {
            format!("Expected {}, got {}. Suggestion: {}", expected, got, sugg)
        } else {
            format!("Expected {}, got {}", expected, got)
        };
        KilnError::ShapeError(message)
    }

    /// Create an operation error with context
    pub fn operation_error(operation: &str, message: &str) -> Self {
        KilnError::OperationError {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for KilnError {
    fn from(err: bincode::Error) -> Self {
        KilnError::SerializationError(err.to_string())
    }
}

/// Result type for kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ShapeMismatch,
    InvalidOperation,
    ConflictingSeed,
    Released,
    SerializationFailed,
    ConfigInvalid,
}

impl KilnError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            KilnError::ShapeError(_) => ErrorCode::ShapeMismatch,
            KilnError::OperationError { .. } => ErrorCode::InvalidOperation,
            KilnError::ConflictingGradientSeed { .. } => ErrorCode::ConflictingSeed,
            KilnError::NodeReleased { .. } => ErrorCode::Released,
            KilnError::SerializationError(_) => ErrorCode::SerializationFailed,
            KilnError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            KilnError::InvalidInput(_) => ErrorCode::InvalidOperation,
            KilnError::InvalidState(_) => ErrorCode::InvalidOperation,
            KilnError::IoError(_) => ErrorCode::InvalidOperation,
        }
    }

    /// Usage errors are programmer mistakes in how the graph was built or driven.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::ShapeMismatch | ErrorCode::ConflictingSeed | ErrorCode::Released
        )
    }
}
