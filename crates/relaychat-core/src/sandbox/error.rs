use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Error class reported by the interpreter, named after the JS error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuntimeErrorKind {
    Error,
    TypeError,
    ReferenceError,
    RangeError,
}

impl RuntimeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeErrorKind::Error => "Error",
            RuntimeErrorKind::TypeError => "TypeError",
            RuntimeErrorKind::ReferenceError => "ReferenceError",
            RuntimeErrorKind::RangeError => "RangeError",
        }
    }
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a fragment could not be executed
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum ExecutionError {
    #[error("SyntaxError: {message}")]
    Syntax { message: String, offset: usize },

    #[error("{kind}: {message}")]
    Runtime {
        kind: RuntimeErrorKind,
        message: String,
    },

    /// A sandbox limit was hit; these cannot be caught by `try`
    #[error("RangeError: {0}")]
    Limit(String),
}

impl ExecutionError {
    pub fn syntax(message: impl Into<String>, offset: usize) -> Self {
        ExecutionError::Syntax {
            message: message.into(),
            offset,
        }
    }

    pub fn runtime(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        ExecutionError::Runtime {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::runtime(RuntimeErrorKind::TypeError, message)
    }

    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::runtime(RuntimeErrorKind::ReferenceError, message)
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::runtime(RuntimeErrorKind::RangeError, message)
    }

    /// The message without the error class prefix
    pub fn message(&self) -> &str {
        match self {
            ExecutionError::Syntax { message, .. } => message,
            ExecutionError::Runtime { message, .. } => message,
            ExecutionError::Limit(message) => message,
        }
    }

    pub fn is_syntax(&self) -> bool {
        matches!(self, ExecutionError::Syntax { .. })
    }
}
