use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{error_for_status, LlmProvider, ModelInfo, ProviderKind};
use crate::types::{FunctionCall, Message, ToolCall, ToolSpec};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    MessageStop,
    Error {
        error: ApiErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// Split out the system prompt and convert the rest into Anthropic turns.
///
/// Tool results travel as `user` turns, and consecutive turns of the same
/// role are merged since the API requires alternation.
fn build_conversation(messages: &[Message]) -> (String, Vec<Value>) {
    let mut system = Vec::new();
    let mut turns: Vec<(String, Vec<Value>)> = Vec::new();

    for message in messages {
        let (role, blocks) = match message.role.as_str() {
            "system" => {
                if !message.content.is_empty() {
                    system.push(message.content.clone());
                }
                continue;
            }
            "tool" | "tool-response" => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content,
                })],
            ),
            "assistant" => {
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": message.content}));
                }
                for call in message.tool_calls.iter().flatten() {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": call.function.arguments_object().map(Value::Object).unwrap_or_else(|_| json!({})),
                    }));
                }
                ("assistant", blocks)
            }
            _ => (
                "user",
                vec![json!({"type": "text", "text": message.content})],
            ),
        };
        if blocks.is_empty() {
            continue;
        }
        match turns.last_mut() {
            Some((last_role, last_blocks)) if last_role == role => last_blocks.extend(blocks),
            _ => turns.push((role.to_string(), blocks)),
        }
    }

    let turns = turns
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect();
    (system.join("\n\n"), turns)
}

#[derive(Debug)]
enum PartialBlock {
    Text,
    ToolUse { id: String, name: String, json: String, input: Value },
}

/// Rebuilds the assistant message from streamed content blocks.
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    blocks: Vec<(usize, PartialBlock)>,
}

impl StreamAccumulator {
    fn block_mut(&mut self, index: usize) -> Option<&mut PartialBlock> {
        self.blocks
            .iter_mut()
            .find(|(i, _)| *i == index)
            .map(|(_, block)| block)
    }

    /// Returns the text delta carried by the event, if any.
    fn push(&mut self, event: StreamEvent) -> Result<Option<String>> {
        match event {
            StreamEvent::ContentBlockStart { index, content_block } => {
                let block = match content_block {
                    ContentBlock::ToolUse { id, name, input } => PartialBlock::ToolUse {
                        id,
                        name,
                        json: String::new(),
                        input,
                    },
                    ContentBlock::Text { text } if !text.is_empty() => {
                        self.content.push_str(&text);
                        self.blocks.push((index, PartialBlock::Text));
                        return Ok(Some(text));
                    }
                    _ => PartialBlock::Text,
                };
                self.blocks.push((index, block));
                Ok(None)
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    self.content.push_str(&text);
                    Ok(Some(text))
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(PartialBlock::ToolUse { json, .. }) = self.block_mut(index) {
                        json.push_str(&partial_json);
                    }
                    Ok(None)
                }
                BlockDelta::Other => Ok(None),
            },
            StreamEvent::Error { error } => Err(anyhow!("anthropic stream error: {}", error.message)),
            StreamEvent::MessageStop | StreamEvent::Other => Ok(None),
        }
    }

    fn finish(self) -> Result<Message> {
        let mut calls = Vec::new();
        for (_, block) in self.blocks {
            if let PartialBlock::ToolUse { id, name, json, input } = block {
                let arguments = if json.trim().is_empty() {
                    input
                } else {
                    serde_json::from_str(&json)
                        .with_context(|| format!("invalid tool input JSON: {}", json))?
                };
                calls.push(ToolCall {
                    id,
                    tool_type: Some("function".to_string()),
                    function: FunctionCall {
                        name,
                        index: None,
                        arguments,
                    },
                });
            }
        }
        Ok(Message::assistant(&self.content, Some(calls)))
    }
}

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(base_url: &str, api_key: &str, model: &str, client: Client) -> Self {
        AnthropicProvider {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn request_body(&self, messages: &[Message], tools: &[ToolSpec], stream: bool) -> Value {
        let (system, turns) = build_conversation(messages);
        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": turns,
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.function.name,
                        "description": tool.function.description,
                        "input_schema": tool.function.parameters,
                    })
                })
                .collect();
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .context("failed to call Anthropic API")?;
        error_for_status(ProviderKind::Anthropic, response).await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .query(&[("limit", "100")])
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .context("failed to reach Anthropic")?;
        let list: ModelList = error_for_status(ProviderKind::Anthropic, response)
            .await?
            .json()
            .await
            .context("failed to parse Anthropic model list")?;

        Ok(list
            .data
            .into_iter()
            .map(|m| {
                let name = m.display_name.unwrap_or_else(|| m.id.clone());
                ModelInfo::new(&m.id, &name)
            })
            .collect())
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Message> {
        let response = self.post(&self.request_body(messages, tools, false)).await?;
        let text = response.text().await.context("failed to read response")?;
        let parsed: MessagesResponse = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse Anthropic response: {}", text))?;

        let mut content = String::new();
        let mut calls = Vec::new();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text } => content.push_str(&text),
                ContentBlock::ToolUse { id, name, input } => calls.push(ToolCall {
                    id,
                    tool_type: Some("function".to_string()),
                    function: FunctionCall {
                        name,
                        index: None,
                        arguments: input,
                    },
                }),
                ContentBlock::Other => {}
            }
        }
        Ok(Message::assistant(&content, Some(calls)))
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        deltas: &mpsc::UnboundedSender<String>,
    ) -> Result<Message> {
        let response = self.post(&self.request_body(messages, tools, true)).await?;
        let mut stream = response.bytes_stream().eventsource();
        let mut acc = StreamAccumulator::default();

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| anyhow!("anthropic SSE stream error: {}", e))?;
            let parsed: StreamEvent = serde_json::from_str(&event.data)
                .with_context(|| format!("SSE parsing error, data: {}", event.data))?;
            let stop = matches!(parsed, StreamEvent::MessageStop);
            if let Some(delta) = acc.push(parsed)? {
                let _ = deltas.send(delta);
            }
            if stop {
                break;
            }
        }

        acc.finish()
    }
}
