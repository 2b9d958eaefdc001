use crate::tools::ToolInfo;
use crate::types::{Message, ToolCall};

const BASE_PROMPT: &str = "You are a helpful assistant with access to tools.\n\
When you call a tool, answer from what the tool returned and do not invent information.\n\
If a tool already gives a complete answer, relay it concisely.";

/// System prompt plus the conversation so far.
#[derive(Debug, Clone, Default)]
pub struct Context {
    system_prompt: String,
    messages: Vec<Message>,
}

impl Context {
    pub fn new(system_prompt: String) -> Self {
        Context {
            system_prompt,
            messages: Vec::new(),
        }
    }

    /// Context whose system prompt lists the given tools.
    pub fn for_tools(tools: &[ToolInfo]) -> Self {
        let mut prompt = BASE_PROMPT.to_string();
        if !tools.is_empty() {
            prompt.push_str("\n\n## Tools\n");
            for tool in tools {
                prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
            }
        }
        Self::new(prompt.trim().to_string())
    }

    pub fn add_user(&mut self, content: &str) {
        self.messages.push(Message::user(content));
    }

    pub fn add_assistant(&mut self, content: &str, tool_calls: Option<Vec<ToolCall>>) {
        self.messages.push(Message::assistant(content, tool_calls));
    }

    pub fn add_tool_result(&mut self, tool_call_id: &str, content: &str) {
        self.messages.push(Message::tool_result(tool_call_id, content));
    }

    /// All messages with the system prompt first.
    pub fn messages(&self) -> Vec<Message> {
        let mut all = Vec::with_capacity(self.messages.len() + 1);
        all.push(Message::system(&self.system_prompt));
        all.extend(self.messages.iter().cloned());
        all
    }

    pub fn raw_messages(&self) -> &[Message] {
        &self.messages
    }

    /// Keep at most the latest `max_messages`, starting at a user turn so no
    /// tool result is left without the call that produced it.
    pub fn truncate(&mut self, max_messages: usize) {
        if self.messages.len() <= max_messages {
            return;
        }
        let mut start = self.messages.len() - max_messages;
        while start < self.messages.len() && self.messages[start].role != "user" {
            start += 1;
        }
        self.messages.drain(0..start);
    }

    /// Drop the history, keep the system prompt.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
