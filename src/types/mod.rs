mod frame;
mod function;
mod message;

pub use frame::{ChatMessage, ServerFrame};
pub use function::{FunctionCall, FunctionDefinition, ToolCall, ToolSpec};
pub use message::Message;
