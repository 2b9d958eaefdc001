pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod server;
pub mod tools;
pub mod types;

pub use agent::{Agent, Context, SessionStore};
pub use cli::run_cli;
pub use config::Config;
pub use server::{router, AppState};
