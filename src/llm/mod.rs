//! LLM providers.
//!
//! Every vendor sits behind [`LlmProvider`]: a non-streaming `chat` and a
//! `chat_stream` that forwards text deltas while assembling the final message
//! (tool calls included). Providers are built per request from a
//! [`ProviderKind`] and a model name.

mod anthropic;
mod ndjson;
mod ollama;
mod openai;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::ProvidersConfig;
use crate::types::{Message, ToolSpec};

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::{validate_image_size, OpenAiProvider, VALID_IMAGE_SIZES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    DeepSeek,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::DeepSeek,
        ProviderKind::Ollama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Ollama => "ollama",
        }
    }

    /// Environment variable holding the API key, if the provider needs one.
    pub fn api_key_var(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::DeepSeek => Some("DEEPSEEK_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "deepseek" => Ok(ProviderKind::DeepSeek),
            "ollama" => Ok(ProviderKind::Ollama),
            _ => Err(anyhow!("Unsupported provider: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

impl ModelInfo {
    pub fn new(id: &str, name: &str) -> Self {
        ModelInfo {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn model(&self) -> &str;

    async fn chat(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Message>;

    /// Streams text deltas into `deltas` and returns the assembled message.
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        deltas: &mpsc::UnboundedSender<String>,
    ) -> Result<Message> {
        let message = self.chat(messages, tools).await?;
        if !message.content.is_empty() {
            let _ = deltas.send(message.content.clone());
        }
        Ok(message)
    }
}

/// Shared HTTP client for providers and tools.
pub fn http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("agentx/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

fn api_key(kind: ProviderKind) -> Result<String> {
    let Some(var) = kind.api_key_var() else {
        return Ok(String::new());
    };
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(anyhow!("{} API key not provided (set {})", kind, var)),
    }
}

/// Fails when the provider's API key is not available.
pub fn check_credentials(kind: ProviderKind) -> Result<()> {
    api_key(kind).map(|_| ())
}

pub fn create_provider(
    kind: ProviderKind,
    model: &str,
    config: &ProvidersConfig,
    client: Client,
) -> Result<Arc<dyn LlmProvider>> {
    if model.trim().is_empty() {
        return Err(anyhow!("model must not be empty"));
    }
    let provider: Arc<dyn LlmProvider> = match kind {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
            kind,
            &config.openai_base_url,
            &api_key(kind)?,
            model,
            client,
        )),
        ProviderKind::DeepSeek => Arc::new(OpenAiProvider::new(
            kind,
            &config.deepseek_base_url,
            &api_key(kind)?,
            model,
            client,
        )),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
            &config.anthropic_base_url,
            &api_key(kind)?,
            model,
            client,
        )),
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(&config.ollama_base_url, model, client)),
    };
    Ok(provider)
}

/// Models offered by a provider.
pub async fn list_models(
    kind: ProviderKind,
    config: &ProvidersConfig,
    client: Client,
) -> Result<Vec<ModelInfo>> {
    match kind {
        ProviderKind::Ollama => OllamaProvider::new(&config.ollama_base_url, "", client)
            .list_models()
            .await,
        ProviderKind::OpenAi => {
            OpenAiProvider::new(kind, &config.openai_base_url, &api_key(kind)?, "", client)
                .list_models()
                .await
        }
        ProviderKind::Anthropic => {
            AnthropicProvider::new(&config.anthropic_base_url, &api_key(kind)?, "", client)
                .list_models()
                .await
        }
        ProviderKind::DeepSeek => Ok(vec![
            ModelInfo::new("deepseek-coder", "DeepSeek Coder"),
            ModelInfo::new("deepseek-chat", "DeepSeek Chat"),
        ]),
    }
}

/// Image generation, OpenAI only.
pub async fn generate_image(
    kind: ProviderKind,
    prompt: &str,
    size: &str,
    config: &ProvidersConfig,
    client: Client,
) -> Result<String> {
    if kind != ProviderKind::OpenAi {
        return Err(anyhow!("Image generation is only supported for OpenAI"));
    }
    validate_image_size(size)?;
    OpenAiProvider::new(kind, &config.openai_base_url, &api_key(kind)?, "dall-e-3", client)
        .generate_image(prompt, size)
        .await
}

/// Non-streaming call with exponential backoff between attempts.
pub async fn chat_with_retry(
    provider: &dyn LlmProvider,
    messages: &[Message],
    tools: &[ToolSpec],
    max_retries: usize,
) -> Result<Message> {
    let attempts = max_retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match provider.chat(messages, tools).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                if attempt < attempts {
                    tracing::warn!(
                        provider = %provider.kind(),
                        "LLM call failed (attempt {}/{}), retrying: {:#}",
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(100 * (1 << attempt))).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(anyhow!(
        "LLM call still failing after {} attempts: {:#}",
        attempts,
        last_error.unwrap_or_else(|| anyhow!("no attempt made"))
    ))
}

/// Turn a non-success response into an error carrying the body text.
async fn error_for_status(kind: ProviderKind, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(anyhow!("{} API error: {} - {}", kind, status, text))
}
