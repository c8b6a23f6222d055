use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::relay::TextGenerator;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
struct GeminiErrorDetail {
    message: String,
}

#[derive(Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

/// Client for the Gemini `generateContent` REST call
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: Some(api_key.to_string()),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Build a client from config. A missing key is not an error here; each
    /// query fails instead, so the server can still start and report it.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: config.gemini_api_key.clone().filter(|k| !k.trim().is_empty()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(self)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model)
    }

    pub async fn query(&self, prompt: &str) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("GEMINI_API_KEY is not set"))?;

        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
        };

        debug!(model = %self.model, "sending generateContent request");
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", api_key)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let detail = serde_json::from_str::<GeminiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(anyhow!("Gemini API error {}: {}", status, detail));
        }

        parse_response(&body)
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.query(prompt).await
    }
}

/// Concatenated text of the first candidate
fn parse_response(body: &str) -> Result<String> {
    let response: GeminiResponse =
        serde_json::from_str(body).context("Malformed generateContent response")?;

    let candidate = match response.candidates.into_iter().next() {
        Some(candidate) => candidate,
        None => {
            let reason = response
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .unwrap_or_else(|| "no candidates returned".to_string());
            return Err(anyhow!("Gemini returned no candidates: {}", reason));
        }
    };

    let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
    let text: String = parts.into_iter().filter_map(|p| p.text).collect();
    if text.is_empty() {
        return Err(anyhow!(
            "Gemini candidate has no text (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        ));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_joins_parts() {
        let body = r#"{
            "candidates": [
                { "content": { "parts": [{ "text": "Hello" }, { "text": ", world" }], "role": "model" } },
                { "content": { "parts": [{ "text": "ignored" }] } }
            ]
        }"#;
        assert_eq!(parse_response(body).unwrap(), "Hello, world");
    }

    #[test]
    fn test_parse_response_blocked_prompt() {
        let body = r#"{ "promptFeedback": { "blockReason": "SAFETY" } }"#;
        let err = parse_response(body).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn test_parse_response_empty_candidate() {
        let body = r#"{ "candidates": [{ "finishReason": "MAX_TOKENS" }] }"#;
        let err = parse_response(body).unwrap_err();
        assert!(err.to_string().contains("MAX_TOKENS"));
    }

    #[test]
    fn test_parse_response_malformed() {
        assert!(parse_response("not json").is_err());
    }

    #[test]
    fn test_endpoint() {
        let client = GeminiClient::new("key").with_base_url("http://localhost:9000/");
        assert_eq!(
            client.endpoint(),
            "http://localhost:9000/v1beta/models/gemini-1.5-flash:generateContent"
        );
        assert_eq!(client.with_model("gemini-pro").model(), "gemini-pro");
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_request() {
        let config = Config {
            gemini_api_key: None,
            base_url: "http://127.0.0.1:1".to_string(),
            ..Config::default()
        };
        let client = GeminiClient::from_config(&config).unwrap();
        let err = client.query("hi").await.unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }
}
