//! HTTP and WebSocket surface: the chat UI, the JSON API and the per-session
//! socket the answers are pushed through.

pub mod api;
mod assets;
pub mod chat;
pub mod hub;
pub mod ws;

use anyhow::{Context as _, Result};
use axum::routing::{get, post};
use axum::Router;
use reqwest::Client;
use std::sync::{Arc, PoisonError, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::agent::{Agent, SessionStore};
use crate::config::Config;
use crate::llm::LlmProvider;
use crate::tools::ToolRegistry;

pub use hub::ConnectionHub;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: SessionStore,
    pub hub: ConnectionHub,
    pub client: Client,
    agent: Arc<RwLock<Agent>>,
}

impl AppState {
    /// State with the bundled tools.
    pub fn new(config: Config, client: Client) -> Self {
        let tools = ToolRegistry::with_defaults(&config.tools, client.clone());
        Self::with_tools(config, client, tools)
    }

    pub fn with_tools(config: Config, client: Client, tools: ToolRegistry) -> Self {
        let agent = Agent::new(None, tools, config.agent.clone());
        AppState {
            config: Arc::new(config),
            sessions: SessionStore::new(),
            hub: ConnectionHub::new(),
            client,
            agent: Arc::new(RwLock::new(agent)),
        }
    }

    /// Copy of the shared agent; requests run on their own copy.
    pub fn agent_snapshot(&self) -> Agent {
        self.agent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_agent(&self, f: impl FnOnce(&mut Agent)) {
        let mut agent = self.agent.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut agent);
    }

    pub fn set_default_provider(&self, provider: Arc<dyn LlmProvider>) {
        self.update_agent(|agent| agent.set_provider(Some(provider)));
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(assets::index))
        .route("/static/app.js", get(assets::script))
        .route("/static/style.css", get(assets::stylesheet))
        .route("/api/chat", post(chat::send_message))
        .route("/api/chat/new", post(api::new_chat))
        .route("/api/chat/clear", post(api::clear))
        .route("/api/chat/cancel/:session_id", post(chat::cancel))
        .route("/api/chat/:session_id/history", get(api::history))
        .route("/api/models/:provider", get(api::models))
        .route("/api/tools", get(api::tools))
        .route("/api/status", get(api::status))
        .route("/api/provider", post(api::set_provider))
        .route("/api/image/generate", post(api::generate_image))
        .route("/api/web/search", post(api::web_search))
        .route("/api/artifacts/create", post(api::create_artifact))
        .route("/api/artifacts/list", get(api::list_artifacts))
        .route("/ws/chat/:session_id", get(ws::chat_socket))
        .nest_service(
            "/artifacts",
            ServeDir::new(state.config.server.artifacts_dir.clone()),
        )
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(config: Config, client: Client) -> Result<()> {
    config.ensure_artifacts()?;
    config.ensure_workspace()?;
    let addr = config.bind_addr();
    let state = AppState::new(config, client);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")
}
