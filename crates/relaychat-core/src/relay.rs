//! Prompt relay: validation in front of a text generator, plus the HTTP
//! client the chat UI uses to reach a relay server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{error, warn};

use crate::api::{ErrorBody, GenerateRequest, GenerateResponse};
use crate::error::RelayError;

/// Text shown as the reply when the relay could not be reached
pub const FETCH_ERROR_PLACEHOLDER: &str = "Error: Failed to fetch response.";

/// Anything that turns a prompt into generated text
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct Relay {
    generator: Arc<dyn TextGenerator>,
}

impl Relay {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Forward a prompt. Blank prompts are rejected without calling out;
    /// otherwise exactly one generation call is made, with no retry.
    pub async fn send(&self, prompt: &str) -> Result<String, RelayError> {
        if prompt.trim().is_empty() {
            return Err(RelayError::InvalidInput);
        }

        match self.generator.generate(prompt).await {
            Ok(text) => Ok(text),
            Err(e) => {
                error!("Error generating content: {:#}", e);
                Err(RelayError::Service(format!("{:#}", e)))
            }
        }
    }

    /// Boundary entry point taking the raw HTTP method and body
    pub async fn dispatch(&self, method: &str, body: &[u8]) -> Result<GenerateResponse, RelayError> {
        if !method.eq_ignore_ascii_case("POST") {
            return Err(RelayError::MethodNotAllowed);
        }

        let request: GenerateRequest = serde_json::from_slice(body).map_err(|e| {
            warn!("Rejecting unparsable request body: {}", e);
            RelayError::InvalidInput
        })?;

        let response = self.send(&request.prompt).await?;
        Ok(GenerateResponse { response })
    }
}

/// Client for a relay server's `/api/generate`
#[derive(Clone)]
pub struct RelayClient {
    client: Client,
    endpoint: String,
}

impl RelayClient {
    pub fn new(server_url: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint_for(server_url),
        }
    }

    pub fn with_timeout(server_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build().context("Failed to build HTTP client")?,
            endpoint: endpoint_for(server_url),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&GenerateRequest {
                prompt: prompt.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.error)
                .unwrap_or_default();
            return Err(anyhow!("Relay error {}: {}", status, detail));
        }

        let body: GenerateResponse = response.json().await?;
        Ok(body.response)
    }

    /// The text to append as the reply: the response, or the placeholder
    pub async fn reply_for(&self, prompt: &str) -> String {
        match self.generate(prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Relay request failed: {:#}", e);
                FETCH_ERROR_PLACEHOLDER.to_string()
            }
        }
    }
}

fn endpoint_for(server_url: &str) -> String {
    format!("{}/api/generate", server_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextGenerator for Echo {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("```{}```", prompt))
        }
    }

    struct Failing;

    #[async_trait]
    impl TextGenerator for Failing {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Err(anyhow!("upstream exploded"))
        }
    }

    fn echo() -> (Arc<Echo>, Relay) {
        let generator = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        (generator.clone(), Relay::new(generator))
    }

    #[tokio::test]
    async fn test_send_forwards_once() {
        let (generator, relay) = echo();
        assert_eq!(relay.send("2+2").await.unwrap(), "```2+2```");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blank_prompt_makes_no_call() {
        let (generator, relay) = echo();
        assert_eq!(relay.send("").await, Err(RelayError::InvalidInput));
        assert_eq!(relay.send("   \n").await, Err(RelayError::InvalidInput));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_downstream_failure_is_service_error() {
        let relay = Relay::new(Arc::new(Failing));
        match relay.send("hello").await {
            Err(RelayError::Service(detail)) => assert!(detail.contains("upstream exploded")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_checks_method_first() {
        let (generator, relay) = echo();
        let err = relay.dispatch("GET", b"not even json").await.unwrap_err();
        assert_eq!(err, RelayError::MethodNotAllowed);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_body_validation() {
        let (generator, relay) = echo();
        assert_eq!(relay.dispatch("POST", b"{}").await.unwrap_err(), RelayError::InvalidInput);
        assert_eq!(relay.dispatch("POST", b"garbage").await.unwrap_err(), RelayError::InvalidInput);
        assert_eq!(
            relay.dispatch("POST", br#"{"prompt": 5}"#).await.unwrap_err(),
            RelayError::InvalidInput
        );
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);

        let response = relay.dispatch("post", br#"{"prompt": "hi"}"#).await.unwrap();
        assert_eq!(response.response, "```hi```");
    }

    #[test]
    fn test_client_endpoint() {
        assert_eq!(
            RelayClient::new("http://127.0.0.1:3000/").endpoint(),
            "http://127.0.0.1:3000/api/generate"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_gives_placeholder() {
        let client = RelayClient::with_timeout("http://127.0.0.1:1", Some(Duration::from_secs(2))).unwrap();
        assert_eq!(client.reply_for("hi").await, FETCH_ERROR_PLACEHOLDER);
    }
}
