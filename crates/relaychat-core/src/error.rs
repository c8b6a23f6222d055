use thiserror::Error;

/// Failures of the prompt relay.
///
/// Each variant maps to an HTTP status and a fixed public message; the detail
/// carried by `Service` is for logs only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Prompt is required")]
    InvalidInput,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Failed to generate content: {0}")]
    Service(String),
}

impl RelayError {
    pub fn status(&self) -> u16 {
        match self {
            RelayError::InvalidInput => 400,
            RelayError::MethodNotAllowed => 405,
            RelayError::Service(_) => 500,
        }
    }

    /// Message safe to return to a client
    pub fn public_message(&self) -> &'static str {
        match self {
            RelayError::InvalidInput => "Prompt is required",
            RelayError::MethodNotAllowed => "Method not allowed",
            RelayError::Service(_) => "Failed to generate content",
        }
    }
}
