use serde::{Deserialize, Serialize};

/// One chat bubble as the browser renders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub is_streaming: bool,
}

impl ChatMessage {
    pub fn user(message_id: &str, content: &str) -> Self {
        ChatMessage {
            id: format!("user-{}", message_id),
            role: "user".to_string(),
            content: content.to_string(),
            is_streaming: false,
        }
    }

    pub fn assistant(message_id: &str, content: &str, is_streaming: bool) -> Self {
        ChatMessage {
            id: format!("assistant-{}", message_id),
            role: "assistant".to_string(),
            content: content.to_string(),
            is_streaming,
        }
    }

    pub fn error(content: &str) -> Self {
        ChatMessage {
            id: format!("error-{}", uuid::Uuid::new_v4()),
            role: "assistant".to_string(),
            content: format!("Error: {}", content),
            is_streaming: false,
        }
    }
}

/// Frames pushed to the browser over `/ws/chat/:session_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Thinking { value: bool },
    Message { content: ChatMessage },
    Pong,
}

impl ServerFrame {
    pub fn thinking(value: bool) -> Self {
        ServerFrame::Thinking { value }
    }

    pub fn message(content: ChatMessage) -> Self {
        ServerFrame::Message { content }
    }
}
