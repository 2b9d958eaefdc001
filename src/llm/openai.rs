use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use super::{error_for_status, LlmProvider, ModelInfo, ProviderKind};
use crate::types::{FunctionCall, Message, ToolCall, ToolSpec};

pub const VALID_IMAGE_SIZES: [&str; 3] = ["256x256", "512x512", "1024x1024"];

pub fn validate_image_size(size: &str) -> Result<()> {
    if VALID_IMAGE_SIZES.contains(&size) {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid size. Supported sizes are: {}",
            VALID_IMAGE_SIZES.join(", ")
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<CompletionToolCall>>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: String,
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChunkData {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageEntry>,
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    #[serde(default)]
    url: Option<String>,
}

fn extract_api_error(event: &Value) -> Option<String> {
    let error = event.get("error")?;
    if let Some(message) = error.get("message").and_then(|v| v.as_str()) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("an error occurred during streaming".to_string())
}

fn wire_message(message: &Message) -> Value {
    let role = match message.role.as_str() {
        "human" => "user",
        "tool-response" => "tool",
        other => other,
    };
    let mut wire = json!({ "role": role, "content": message.content });
    if let Some(calls) = message.tool_calls.as_ref().filter(|c| !c.is_empty()) {
        wire["tool_calls"] = calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.function.name,
                        "arguments": call.function.arguments_string(),
                    }
                })
            })
            .collect();
        if message.content.is_empty() {
            wire["content"] = Value::Null;
        }
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Assembles SSE chunks; tool-call fragments are keyed by their index.
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
}

impl StreamAccumulator {
    fn push(&mut self, chunk: ChunkData) -> Option<String> {
        let mut delta_text = String::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                delta_text.push_str(&text);
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                let entry = self.calls.entry(call.index).or_default();
                if let Some(id) = call.id {
                    entry.id = id;
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        entry.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
        }
        if delta_text.is_empty() {
            return None;
        }
        self.content.push_str(&delta_text);
        Some(delta_text)
    }

    fn finish(self) -> Message {
        let calls = self
            .calls
            .into_iter()
            .map(|(index, call)| ToolCall {
                id: if call.id.is_empty() {
                    format!("call_{}", index)
                } else {
                    call.id
                },
                tool_type: Some("function".to_string()),
                function: FunctionCall {
                    name: call.name,
                    index: Some(index as u32),
                    arguments: Value::String(call.arguments),
                },
            })
            .collect();
        Message::assistant(&self.content, Some(calls))
    }
}

/// OpenAI chat completions API; DeepSeek speaks the same protocol.
pub struct OpenAiProvider {
    kind: ProviderKind,
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(kind: ProviderKind, base_url: &str, api_key: &str, model: &str, client: Client) -> Self {
        OpenAiProvider {
            kind,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn request_body(&self, messages: &[Message], tools: &[ToolSpec], stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": stream,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to call {} API", self.kind))?;
        error_for_status(self.kind, response).await
    }

    /// Chat models (`gpt-4*`, `gpt-3.5*`), sorted by id.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .client
            .get(self.url("models"))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.kind))?;
        let list: ModelList = error_for_status(self.kind, response)
            .await?
            .json()
            .await
            .context("failed to parse model list")?;

        let mut models: Vec<ModelInfo> = list
            .data
            .into_iter()
            .filter(|m| m.id.starts_with("gpt-4") || m.id.starts_with("gpt-3.5"))
            .map(|m| ModelInfo::new(&m.id, &m.id))
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }

    /// Generate one image with `dall-e-3` and return its URL.
    pub async fn generate_image(&self, prompt: &str, size: &str) -> Result<String> {
        if prompt.trim().is_empty() {
            return Err(anyhow!("Prompt is required"));
        }
        validate_image_size(size)?;

        let response = self
            .client
            .post(self.url("images/generations"))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": "dall-e-3",
                "prompt": prompt,
                "size": size,
                "quality": "standard",
                "n": 1,
            }))
            .send()
            .await
            .context("failed to call image generation API")?;
        let images: ImageResponse = error_for_status(self.kind, response)
            .await?
            .json()
            .await
            .context("failed to parse image generation response")?;

        images
            .data
            .into_iter()
            .find_map(|image| image.url)
            .ok_or_else(|| anyhow!("image generation returned no URL"))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Message> {
        let response = self.post(&self.request_body(messages, tools, false)).await?;
        let text = response.text().await.context("failed to read response")?;
        let completion: ChatCompletion = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {} response: {}", self.kind, text))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("{} returned no choices", self.kind))?;

        let calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                tool_type: Some("function".to_string()),
                function: FunctionCall {
                    name: call.function.name,
                    index: None,
                    arguments: Value::String(call.function.arguments),
                },
            })
            .collect();

        Ok(Message::assistant(
            &choice.message.content.unwrap_or_default(),
            Some(calls),
        ))
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
            let event = event.map_err(|e| anyhow!("{} SSE stream error: {}", self.kind, e))?;
            let raw = event.data;
            if raw == "[DONE]" {
                break;
            }

            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("SSE parsing error, data: {}", raw))?;
            if let Some(message) = extract_api_error(&value) {
                return Err(anyhow!("{} API error: {}", self.kind, message));
            }
            let chunk: ChunkData = serde_json::from_value(value)
                .with_context(|| format!("SSE data schema error, data: {}", raw))?;
            if let Some(delta) = acc.push(chunk) {
                let _ = deltas.send(delta);
            }
        }

        Ok(acc.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(value: Value) -> ChunkData {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn tool_call_fragments_are_joined_by_index() {
        let mut acc = StreamAccumulator::default();
        acc.push(chunk(json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_a", "function": {"name": "web_search", "arguments": "{\"qu"}}
        ]}}]})));
        acc.push(chunk(json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "ery\":\"rust\"}"}},
            {"index": 1, "id": "call_b", "function": {"name": "system_info", "arguments": "{}"}}
        ]}}]})));

        let message = acc.finish();
        let calls = message.tool_calls.unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(
            calls[0].function.arguments_object().unwrap()["query"],
            json!("rust")
        );
        assert_eq!(calls[1].function.name, "system_info");
    }

    #[test]
    fn text_deltas_are_returned_and_accumulated() {
        let mut acc = StreamAccumulator::default();
        assert_eq!(
            acc.push(chunk(json!({"choices": [{"delta": {"content": "Hel"}}]}))).as_deref(),
            Some("Hel")
        );
        assert_eq!(acc.push(chunk(json!({"choices": [{"delta": {}}]}))), None);
        acc.push(chunk(json!({"choices": [{"delta": {"content": "lo"}}]})));
        let message = acc.finish();
        assert_eq!(message.content, "Hello");
        assert!(message.tool_calls.is_none());
    }

    #[test]
    fn assistant_tool_calls_use_string_arguments() {
        let message = Message::assistant(
            "",
            Some(vec![ToolCall {
                id: "call_1".to_string(),
                tool_type: None,
                function: FunctionCall {
                    name: "file_system".to_string(),
                    index: None,
                    arguments: json!({"operation": "list"}),
                },
            }]),
        );
        let wire = wire_message(&message);
        assert_eq!(wire["content"], Value::Null);
        assert!(wire["tool_calls"][0]["function"]["arguments"].is_string());

        let result = wire_message(&Message::tool_result("call_1", "a\nb"));
        assert_eq!(result["role"], "tool");
        assert_eq!(result["tool_call_id"], "call_1");
    }

    #[test]
    fn api_error_shapes_are_recognised() {
        assert_eq!(
            extract_api_error(&json!({"error": {"message": "quota"}})).as_deref(),
            Some("quota")
        );
        assert_eq!(
            extract_api_error(&json!({"error": "bad"})).as_deref(),
            Some("bad")
        );
        assert!(extract_api_error(&json!({"choices": []})).is_none());
    }

    #[test]
    fn image_sizes_are_validated() {
        assert!(validate_image_size("512x512").is_ok());
        let err = validate_image_size("2048x2048").unwrap_err();
        assert!(err.to_string().contains("size"));
    }
}
