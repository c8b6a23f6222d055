pub mod ai;
pub mod api;
pub mod config;
pub mod error;
pub mod relay;
pub mod render;
pub mod sandbox;
pub mod state;

// Re-export main types for convenience
pub use ai::GeminiClient;
pub use api::{ErrorBody, GenerateRequest, GenerateResponse};
pub use config::Config;
pub use error::RelayError;
pub use relay::{Relay, RelayClient, TextGenerator, FETCH_ERROR_PLACEHOLDER};
pub use render::{extract_fragment, highlight, render, CodeFragment, Delimiter, RenderedView, Renderer};
pub use sandbox::{execute, ExecutionError, ExecutionView, Executor, SandboxLimits};
pub use state::{Conversation, Message, MessageKind};
