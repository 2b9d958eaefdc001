use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::ndjson::LineDecoder;
use super::{error_for_status, LlmProvider, ModelInfo, ProviderKind};
use crate::types::{FunctionCall, Message, ToolCall, ToolSpec};

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec>,
    stream: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    message: OllamaMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

impl From<&Message> for OllamaMessage {
    fn from(message: &Message) -> Self {
        let tool_calls = message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|call| OllamaToolCall {
                    id: None,
                    function: FunctionCall {
                        name: call.function.name.clone(),
                        index: None,
                        // Ollama wants arguments as an object.
                        arguments: call
                            .function
                            .arguments_object()
                            .map(Value::Object)
                            .unwrap_or_else(|_| Value::Object(Default::default())),
                    },
                })
                .collect()
        });
        OllamaMessage {
            role: message.role.clone(),
            content: message.content.clone(),
            tool_calls,
        }
    }
}

/// Collects streamed chunks into one assistant message.
#[derive(Debug, Default)]
struct ReplyBuilder {
    content: String,
    tool_calls: Vec<ToolCall>,
}

impl ReplyBuilder {
    fn push(&mut self, message: OllamaMessage) -> Option<String> {
        for call in message.tool_calls.unwrap_or_default() {
            let id = call
                .id
                .unwrap_or_else(|| format!("call_{}", self.tool_calls.len()));
            self.tool_calls.push(ToolCall {
                id,
                tool_type: Some("function".to_string()),
                function: call.function,
            });
        }
        if message.content.is_empty() {
            return None;
        }
        self.content.push_str(&message.content);
        Some(message.content)
    }

    fn finish(self) -> Message {
        Message::assistant(&self.content, Some(self.tool_calls))
    }
}

pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(base_url: &str, model: &str, client: Client) -> Self {
        OllamaProvider {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    fn request(&self, messages: &[Message], tools: &[ToolSpec], stream: bool) -> OllamaRequest {
        OllamaRequest {
            model: self.model.clone(),
            messages: messages.iter().map(OllamaMessage::from).collect(),
            tools: tools.to_vec(),
            stream,
        }
    }

    fn parse_line(line: &str) -> Result<OllamaResponse> {
        let response: OllamaResponse = serde_json::from_str(line)
            .with_context(|| format!("failed to parse Ollama response: {}", line))?;
        if let Some(err) = response.error {
            return Err(anyhow!("Ollama error: {}", err));
        }
        Ok(response)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to reach Ollama")?;
        let tags: TagsResponse = error_for_status(ProviderKind::Ollama, response)
            .await?
            .json()
            .await
            .context("failed to parse Ollama model list")?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo::new(&m.name, &m.name))
            .collect())
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Message> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.request(messages, tools, false))
            .send()
            .await
            .context("failed to call Ollama API")?;

        let text = error_for_status(ProviderKind::Ollama, response)
            .await?
            .text()
            .await
            .context("failed to read Ollama response")?;

        let mut reply = ReplyBuilder::default();
        reply.push(Self::parse_line(&text)?.message);
        Ok(reply.finish())
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        deltas: &mpsc::UnboundedSender<String>,
    ) -> Result<Message> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.request(messages, tools, true))
            .send()
            .await
            .context("failed to call Ollama API")?;
        let response = error_for_status(ProviderKind::Ollama, response).await?;

        let mut stream = response.bytes_stream();
        let mut decoder = LineDecoder::default();
        let mut reply = ReplyBuilder::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Ollama stream interrupted")?;
            for line in decoder.push(&chunk) {
                let parsed = Self::parse_line(&line)?;
                if let Some(delta) = reply.push(parsed.message) {
                    let _ = deltas.send(delta);
                }
                if parsed.done {
                    return Ok(reply.finish());
                }
            }
        }
        if let Some(line) = decoder.finish() {
            let parsed = Self::parse_line(&line)?;
            if let Some(delta) = reply.push(parsed.message) {
                let _ = deltas.send(delta);
            }
        }

        Ok(reply.finish())
    }
}
