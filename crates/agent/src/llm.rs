use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::debug;

use eventcrew_core::config::{LlmConfig, LlmProvider};
use eventcrew_core::errors::ApplicationError;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// One oracle call bounded by `timeout`, classified into the oracle error
/// variants. There is no retry.
pub async fn complete_within(
    oracle: &dyn LlmClient,
    prompt: &str,
    timeout: Duration,
) -> Result<String, ApplicationError> {
    match tokio::time::timeout(timeout, oracle.complete(prompt)).await {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(error)) => Err(ApplicationError::Oracle(error.to_string())),
        Err(_) => Err(ApplicationError::OracleTimeout { after: timeout }),
    }
}

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 1024;
const ERROR_BODY_LIMIT: usize = 512;

/// Chat-completion client for the configured provider. One request per
/// prompt, no streaming.
pub struct HttpLlmClient {
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    client: Client,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build oracle http client")?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(config.provider).to_string());

        Ok(Self {
            provider: config.provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        let path = match self.provider {
            LlmProvider::OpenAi => "/v1/chat/completions",
            LlmProvider::Anthropic => "/v1/messages",
            LlmProvider::Ollama => "/api/generate",
        };
        format!("{}{path}", self.base_url)
    }

    fn request_body(&self, prompt: &str) -> Value {
        match self.provider {
            LlmProvider::OpenAi => json!({
                "model": self.model,
                "messages": [{ "role": "user", "content": prompt }],
            }),
            LlmProvider::Anthropic => json!({
                "model": self.model,
                "max_tokens": MAX_OUTPUT_TOKENS,
                "messages": [{ "role": "user", "content": prompt }],
            }),
            LlmProvider::Ollama => json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
            }),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut request = self.client.post(self.endpoint()).json(&self.request_body(prompt));
        match self.provider {
            LlmProvider::OpenAi => {
                if let Some(key) = &self.api_key {
                    request = request.bearer_auth(key.expose_secret());
                }
            }
            LlmProvider::Anthropic => {
                if let Some(key) = &self.api_key {
                    request = request.header("x-api-key", key.expose_secret());
                }
                request = request.header("anthropic-version", ANTHROPIC_VERSION);
            }
            LlmProvider::Ollama => {}
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                anyhow!("oracle request timed out: {error}")
            } else if error.is_connect() {
                anyhow!("cannot reach oracle at {}: {error}", self.base_url)
            } else {
                anyhow!("oracle request failed: {error}")
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("oracle returned {status}: {}", truncate(&detail, ERROR_BODY_LIMIT)));
        }

        let body: Value = response.json().await.context("oracle response was not valid json")?;
        let text = extract_text(self.provider, &body)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| anyhow!("oracle response had no text content"))?;

        debug!(
            event_name = "oracle.completed",
            provider = ?self.provider,
            model = %self.model,
            prompt_chars = prompt.len(),
            reply_chars = text.len(),
            "oracle completion received"
        );
        Ok(text)
    }
}

fn default_base_url(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => OPENAI_BASE_URL,
        LlmProvider::Anthropic => ANTHROPIC_BASE_URL,
        LlmProvider::Ollama => "http://localhost:11434",
    }
}

fn extract_text(provider: LlmProvider, body: &Value) -> Option<String> {
    match provider {
        LlmProvider::OpenAi => {
            body["choices"][0]["message"]["content"].as_str().map(str::to_owned)
        }
        LlmProvider::Anthropic => body["content"].as_array().and_then(|blocks| {
            blocks
                .iter()
                .find(|block| block["type"] == "text")
                .and_then(|block| block["text"].as_str())
                .map(str::to_owned)
        }),
        LlmProvider::Ollama => body["response"].as_str().map(str::to_owned),
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
