use crate::config::{ApiFlavor, LlmConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("LLM backend unreachable: {0}")]
    Unreachable(String),
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
    #[error("LLM backend rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("unexpected LLM response: {0}")]
    Malformed(String),
}

/// Text-rewriting capability. One prompt in, one completion out.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn respond(&self, prompt: &str) -> Result<String, OracleError>;
}

/// Calls `oracle`, giving up after `timeout` (`None` waits forever).
pub async fn respond_within<O: Oracle + ?Sized>(
    oracle: &O,
    prompt: &str,
    timeout: Option<Duration>,
) -> Result<String, OracleError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, oracle.respond(prompt))
            .await
            .map_err(|_| OracleError::Timeout(limit))?,
        None => oracle.respond(prompt).await,
    }
}

pub struct LLMClient {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
    flavor: ApiFlavor,
    temperature: f32,
}

impl LLMClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;

        Ok(LLMClient {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            flavor: config.flavor,
            temperature: config.temperature,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {key}")),
            None => request,
        }
    }

    /// Fails unless the backend answers its model listing endpoint.
    pub async fn probe(&self) -> Result<(), OracleError> {
        let path = match self.flavor {
            ApiFlavor::Ollama => "/api/tags",
            ApiFlavor::OpenAi => "/v1/models",
        };
        let response = self
            .with_auth(self.client.get(self.endpoint(path)))
            .send()
            .await
            .map_err(|e| OracleError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        tracing::info!(url = %self.api_url, model = %self.model, "LLM backend reachable");
        Ok(())
    }

    fn request_body(&self, prompt: &str) -> (String, Value) {
        match self.flavor {
            ApiFlavor::Ollama => (
                self.endpoint("/api/generate"),
                json!({
                    "model": self.model,
                    "prompt": prompt,
                    "stream": false,
                    "options": {
                        "temperature": self.temperature
                    }
                }),
            ),
            ApiFlavor::OpenAi => (
                self.endpoint("/v1/chat/completions"),
                json!({
                    "model": self.model,
                    "messages": [{ "role": "user", "content": prompt }],
                    "temperature": self.temperature,
                    "stream": false
                }),
            ),
        }
    }
}

#[async_trait]
impl Oracle for LLMClient {
    async fn respond(&self, prompt: &str) -> Result<String, OracleError> {
        let (url, body) = self.request_body(prompt);
        let response = self
            .with_auth(self.client.post(url).json(&body))
            .send()
            .await
            .map_err(|e| OracleError::Unreachable(e.to_string()))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| OracleError::Unreachable(e.to_string()))?;
        if !status.is_success() {
            return Err(OracleError::Rejected {
                status: status.as_u16(),
                body: response_text,
            });
        }

        let value: Value = serde_json::from_str(&response_text)
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        extract_completion(self.flavor, &value)
    }
}

fn extract_completion(flavor: ApiFlavor, value: &Value) -> Result<String, OracleError> {
    let text = match flavor {
        ApiFlavor::Ollama => value.get("response"),
        ApiFlavor::OpenAi => value.pointer("/choices/0/message/content"),
    };
    text.and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| OracleError::Malformed(format!("no completion text in {value}")))
}
