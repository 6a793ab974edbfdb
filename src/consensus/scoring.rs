//! External scoring service boundary
//!
//! The aggregator only needs "send these messages, get text back". The
//! production implementation talks to an OpenRouter-compatible
//! chat-completions endpoint; tests plug in deterministic stubs.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::ScoringConfig;

/// One chat-style scoring request: fixed instructions plus one message per
/// coalition member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringRequest {
    pub system: String,
    pub messages: Vec<String>,
}

#[async_trait]
pub trait ScoringService: Send + Sync {
    /// Return the raw text reply of the model
    async fn score(&self, request: &ScoringRequest) -> Result<String>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

/// OpenRouter chat-completions client
pub struct OpenRouterClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenRouterClient {
    pub fn new(config: &ScoringConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .user_agent("SilicaConsensus/0.1")
            .build()
            .context("Failed to build scoring HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.api_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl ScoringService for OpenRouterClient {
    async fn score(&self, request: &ScoringRequest) -> Result<String> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage {
            role: "system",
            content: &request.system,
        });
        messages.extend(request.messages.iter().map(|content| ChatMessage {
            role: "user",
            content,
        }));

        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Scoring request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Scoring service returned {}: {}", status, text));
        }

        let payload: Value = response
            .json()
            .await
            .context("Scoring service returned invalid JSON")?;

        let content = extract_content(&payload)?;
        debug!(model = %self.model, reply = %content, "Scoring reply received");
        Ok(content)
    }
}

/// Pull `choices[0].message.content` out of a chat-completions response
pub fn extract_content(payload: &Value) -> Result<String> {
    payload
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Scoring response has no choices[0].message.content"))
}
