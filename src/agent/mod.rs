pub mod context;
pub mod core;
pub mod session;

pub use context::Context;
pub use core::{Agent, AgentEvent, AgentStatus, AgentUpdate, RequestOutcome};
pub use session::{ChatSession, SessionError, SessionStore, SessionSummary};
