//! Chat model client
//!
//! The pipeline only ever needs "send a system + user prompt, get text
//! back". `ChatModel` is that seam; `HttpChatModel` implements it over
//! reqwest for Anthropic, OpenAI and Azure OpenAI endpoints.

use crate::config::{ModelConfig, Provider};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// A single prompt exchange
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    /// Ask the endpoint for a JSON object response when it supports it
    pub json_mode: bool,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            json_mode: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Human-readable model identity for logs
    fn name(&self) -> &str;

    /// Per-call timeout the caller should apply
    fn timeout(&self) -> Duration;

    /// Send one request and return the raw text content
    async fn complete(&self, request: &ChatRequest) -> Result<String>;
}

/// HTTP-backed chat model
pub struct HttpChatModel {
    config: ModelConfig,
    client: reqwest::Client,
}

impl HttpChatModel {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn url(&self) -> String {
        match self.config.provider {
            Provider::Anthropic | Provider::OpenAi => self.config.endpoint.clone(),
            Provider::Azure => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.config.endpoint.trim_end_matches('/'),
                self.config.model,
                self.config.api_version.as_deref().unwrap_or_default()
            ),
        }
    }

    fn body(&self, request: &ChatRequest) -> serde_json::Value {
        match self.config.provider {
            Provider::Anthropic => serde_json::json!({
                "model": self.config.model,
                "max_tokens": self.config.max_tokens,
                "temperature": self.config.temperature,
                "system": request.system,
                "messages": [
                    {"role": "user", "content": request.user}
                ]
            }),
            Provider::OpenAi | Provider::Azure => {
                let mut body = serde_json::json!({
                    "model": self.config.model,
                    "max_tokens": self.config.max_tokens,
                    "temperature": self.config.temperature,
                    "messages": [
                        {"role": "system", "content": request.system},
                        {"role": "user", "content": request.user}
                    ]
                });
                if request.json_mode {
                    body["response_format"] = serde_json::json!({"type": "json_object"});
                }
                body
            }
        }
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let builder = self.client.post(self.url()).json(&self.body(request));
        let builder = match self.config.provider {
            Provider::Anthropic => builder
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", "2023-06-01"),
            Provider::OpenAi => builder.bearer_auth(&self.config.api_key),
            Provider::Azure => builder.header("api-key", &self.config.api_key),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| PipelineError::TransientCallFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::MalformedResponse(format!("response body: {}", e)))?;

        extract_content(self.config.provider, &json)
    }
}

/// Rate limits and server errors are worth retrying; the rest are not
fn classify_status(status: u16, body: String) -> PipelineError {
    if status == 429 || status == 408 || status >= 500 {
        PipelineError::TransientCallFailure(format!("status {}: {}", status, body))
    } else {
        PipelineError::ModelRejected { status, body }
    }
}

fn extract_content(provider: Provider, json: &serde_json::Value) -> Result<String> {
    let pointer = match provider {
        Provider::Anthropic => "/content/0/text",
        Provider::OpenAi | Provider::Azure => "/choices/0/message/content",
    };
    json.pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| PipelineError::MalformedResponse("response missing text content".into()))
}
