use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::llm::{chat_with_retry, LlmProvider};
use crate::tools::{Tool, ToolInfo, ToolRegistry};
use crate::types::{Message, ToolCall, ToolSpec};

use super::context::Context;

pub const MAX_STEPS_MESSAGE: &str =
    "Reached the maximum number of steps for this request. Please simplify the question or start a new chat.";
pub const CANCELLED_MESSAGE: &str = "Request cancelled";

/// Progress reported while a request runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Streamed answer text.
    Delta(String),
    ToolCall { name: String, arguments: String },
    ToolResult { name: String, output: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub llm_provider: Option<String>,
    pub model: Option<String>,
    pub num_tools: usize,
    pub max_steps: usize,
    pub verbose: bool,
    pub tools: Vec<String>,
}

/// Partial update of the agent settings; unset fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentUpdate {
    pub max_steps: Option<usize>,
    pub max_llm_retries: Option<usize>,
    pub max_tool_calls: Option<usize>,
    pub max_context_messages: Option<usize>,
    pub verbose: Option<bool>,
}

/// Result of [`Agent::process_request`]: the answer, or `{error: true, message}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RequestOutcome {
    Answer(String),
    Failed { error: bool, message: String },
}

#[derive(Clone)]
pub struct Agent {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: ToolRegistry,
    config: AgentConfig,
}

impl Agent {
    pub fn new(
        provider: Option<Arc<dyn LlmProvider>>,
        tools: ToolRegistry,
        config: AgentConfig,
    ) -> Self {
        Agent {
            provider,
            tools,
            config,
        }
    }

    /// Same tools and settings, different provider.
    pub fn with_provider(&self, provider: Arc<dyn LlmProvider>) -> Self {
        Agent {
            provider: Some(provider),
            tools: self.tools.clone(),
            config: self.config.clone(),
        }
    }

    pub fn set_provider(&mut self, provider: Option<Arc<dyn LlmProvider>>) {
        self.provider = provider;
    }

    pub fn provider(&self) -> Option<&Arc<dyn LlmProvider>> {
        self.provider.as_ref()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn add_tool(&mut self, tool: Arc<dyn Tool>) {
        tracing::info!(tool = tool.name(), "tool added");
        self.tools.add(tool);
    }

    pub fn remove_tool(&mut self, name: &str) -> bool {
        let removed = self.tools.remove(name);
        if removed {
            tracing::info!(tool = name, "tool removed");
        }
        removed
    }

    pub fn available_tools(&self) -> Vec<ToolInfo> {
        self.tools.infos()
    }

    pub fn update_configuration(&mut self, update: AgentUpdate) {
        if let Some(max_steps) = update.max_steps {
            self.config.max_steps = max_steps;
        }
        if let Some(retries) = update.max_llm_retries {
            self.config.max_llm_retries = retries;
        }
        if let Some(max_tool_calls) = update.max_tool_calls {
            self.config.max_tool_calls = max_tool_calls;
        }
        if let Some(max_context_messages) = update.max_context_messages {
            self.config.max_context_messages = max_context_messages;
        }
        if let Some(verbose) = update.verbose {
            self.config.verbose = verbose;
        }
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            llm_provider: self.provider.as_ref().map(|p| p.kind().to_string()),
            model: self.provider.as_ref().map(|p| p.model().to_string()),
            num_tools: self.tools.len(),
            max_steps: self.config.max_steps,
            verbose: self.config.verbose,
            tools: self.tools.names(),
        }
    }

    /// Fresh context whose system prompt describes the current tools.
    pub fn new_context(&self) -> Context {
        Context::for_tools(&self.tools.infos())
    }

    /// One-shot request against a fresh context.
    pub async fn process_request(&self, request: &str, stream: bool) -> RequestOutcome {
        let mut context = self.new_context();
        match self
            .run(&mut context, request, stream, None, &CancellationToken::new())
            .await
        {
            Ok(answer) => RequestOutcome::Answer(answer),
            Err(e) => {
                tracing::error!("request failed: {:#}", e);
                RequestOutcome::Failed {
                    error: true,
                    message: format!("{:#}", e),
                }
            }
        }
    }

    /// The tool-calling loop: ask the model, run requested tools, repeat until
    /// a plain answer or `max_steps`.
    pub async fn run(
        &self,
        context: &mut Context,
        request: &str,
        stream: bool,
        events: Option<&mpsc::UnboundedSender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| anyhow!("No LLM provider configured"))?;

        context.add_user(request);
        context.truncate(self.config.max_context_messages.max(1));
        let specs = self.tools.specs();
        let max_steps = self.config.max_steps;

        for step in 1..=max_steps {
            if cancel.is_cancelled() {
                return Err(anyhow!(CANCELLED_MESSAGE));
            }
            if self.config.verbose {
                tracing::info!(step, max_steps, "agent step");
            } else {
                tracing::debug!(step, max_steps, "agent step");
            }

            let messages = context.messages();
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(anyhow!(CANCELLED_MESSAGE)),
                response = self.call_llm(provider.as_ref(), &messages, &specs, stream, events) => response?,
            };

            let Some(tool_calls) = response.tool_calls.clone().filter(|c| !c.is_empty()) else {
                tracing::debug!(step, "final answer");
                context.add_assistant(&response.content, None);
                return Ok(response.content);
            };

            if tool_calls.len() > self.config.max_tool_calls {
                let warning = format!(
                    "Too many tool calls in one step ({}), skipping them",
                    tool_calls.len()
                );
                tracing::warn!("{}", warning);
                context.add_assistant(&warning, None);
                continue;
            }

            context.add_assistant(&response.content, Some(tool_calls.clone()));

            for call in &tool_calls {
                let output = tokio::select! {
                    _ = cancel.cancelled() => return Err(anyhow!(CANCELLED_MESSAGE)),
                    output = self.execute_tool_call(call, events) => output,
                };
                context.add_tool_result(&call.id, &output);
            }
        }

        tracing::warn!(max_steps, "step limit reached");
        context.add_assistant(MAX_STEPS_MESSAGE, None);
        Ok(MAX_STEPS_MESSAGE.to_string())
    }

    async fn call_llm(
        &self,
        provider: &dyn LlmProvider,
        messages: &[Message],
        specs: &[ToolSpec],
        stream: bool,
        events: Option<&mpsc::UnboundedSender<AgentEvent>>,
    ) -> Result<Message> {
        if !stream {
            return chat_with_retry(provider, messages, specs, self.config.max_llm_retries).await;
        }

        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
        let call = provider.chat_stream(messages, specs, &delta_tx);
        tokio::pin!(call);

        let emit = |delta: String| {
            if let Some(events) = events {
                let _ = events.send(AgentEvent::Delta(delta));
            }
        };

        let result = loop {
            tokio::select! {
                Some(delta) = delta_rx.recv() => emit(delta),
                result = &mut call => break result,
            }
        };
        while let Ok(delta) = delta_rx.try_recv() {
            emit(delta);
        }
        result
    }

    /// Tool failures become the tool result so the model can react to them.
    async fn execute_tool_call(
        &self,
        call: &ToolCall,
        events: Option<&mpsc::UnboundedSender<AgentEvent>>,
    ) -> String {
        let name = call.function.name.as_str();
        let arguments = call.function.arguments_string();
        tracing::info!(tool = name, %arguments, "calling tool");
        if let Some(events) = events {
            let _ = events.send(AgentEvent::ToolCall {
                name: name.to_string(),
                arguments,
            });
        }

        let output = match call.function.arguments_object() {
            Ok(args) => match self.tools.execute(name, &args).await {
                Ok(output) => {
                    tracing::debug!(tool = name, "tool succeeded");
                    output
                }
                Err(e) => {
                    tracing::warn!(tool = name, "tool failed: {:#}", e);
                    format!("Tool execution failed: {:#}", e)
                }
            },
            Err(e) => {
                tracing::warn!(tool = name, "bad tool arguments: {}", e);
                format!("Failed to parse tool arguments: {}", e)
            }
        };

        if let Some(events) = events {
            let _ = events.send(AgentEvent::ToolResult {
                name: name.to_string(),
                output: output.clone(),
            });
        }
        output
    }
}
