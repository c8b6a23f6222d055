//! HTTP front for the prompt relay.

pub mod server;

pub use server::{create_router, AppState};
