use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::agent::{Agent, AgentEvent};
use crate::error::{ApiError, ApiResult};
use crate::llm::{self, ProviderKind};
use crate::types::{ChatMessage, ServerFrame};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub message: String,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Validate, then answer in the background; frames go out over the session's socket.
pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<Value>> {
    let session_id = request.session_id.as_str();
    if !state.sessions.contains(session_id) {
        return Err(ApiError::SessionNotFound);
    }
    if !state.hub.is_connected(session_id) {
        return Err(ApiError::NotConnected);
    }
    let (Some(provider), Some(model)) = (non_empty(&request.provider), non_empty(&request.model))
    else {
        return Err(ApiError::SelectionMissing);
    };
    let kind: ProviderKind = provider
        .parse()
        .map_err(|e: anyhow::Error| ApiError::BadRequest(e.to_string()))?;
    let provider = llm::create_provider(kind, model, &state.config.providers, state.client.clone())
        .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;

    let agent = state.agent_snapshot().with_provider(provider);
    let cancel = state.sessions.begin_request(session_id)?;
    let message_id = uuid::Uuid::new_v4().to_string();

    tracing::info!(session_id, %message_id, provider = %kind, model, "chat request accepted");
    tokio::spawn(run_chat(
        state.clone(),
        agent,
        request.session_id.clone(),
        message_id.clone(),
        request.message,
        cancel,
    ));

    Ok(Json(json!({ "status": "success", "message_id": message_id })))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    if state.sessions.cancel(&session_id) {
        tracing::info!(%session_id, "request cancelled");
    }
    Json(json!({ "status": "success" }))
}

fn push(state: &AppState, session_id: &str, message: ChatMessage, record: bool) {
    if record {
        let _ = state.sessions.append(session_id, message.clone());
    }
    state.hub.send(session_id, ServerFrame::message(message));
}

/// One chat turn: thinking on, user echo, streamed answer, final answer, thinking off.
pub async fn run_chat(
    state: AppState,
    agent: Agent,
    session_id: String,
    message_id: String,
    text: String,
    cancel: CancellationToken,
) {
    state.hub.send(&session_id, ServerFrame::thinking(true));
    push(&state, &session_id, ChatMessage::user(&message_id, &text), true);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let forwarder = {
        let state = state.clone();
        let session_id = session_id.clone();
        let message_id = message_id.clone();
        tokio::spawn(async move {
            let mut streamed = String::new();
            while let Some(event) = events_rx.recv().await {
                match event {
                    AgentEvent::Delta(delta) => {
                        streamed.push_str(&delta);
                        push(
                            &state,
                            &session_id,
                            ChatMessage::assistant(&message_id, &streamed, true),
                            false,
                        );
                    }
                    AgentEvent::ToolCall { name, arguments } => {
                        // The next step streams a fresh answer into the same bubble.
                        streamed.clear();
                        tracing::info!(%session_id, tool = %name, %arguments, "tool call");
                    }
                    AgentEvent::ToolResult { name, output } => {
                        tracing::debug!(%session_id, tool = %name, bytes = output.len(), "tool result");
                    }
                }
            }
        })
    };

    let (mut context, generation) = state
        .sessions
        .checkout(&session_id)
        .unwrap_or_else(|| (agent.new_context(), 0));
    let result = agent
        .run(&mut context, &text, true, Some(&events_tx), &cancel)
        .await;
    drop(events_tx);
    let _ = forwarder.await;
    if result.is_ok() {
        if let Ok(false) = state.sessions.commit_context(&session_id, context, generation) {
            tracing::info!(%session_id, "chat cleared during the request, context not kept");
        }
    }
    state.sessions.finish_request(&session_id);

    match result {
        Ok(answer) => {
            push(
                &state,
                &session_id,
                ChatMessage::assistant(&message_id, &answer, false),
                true,
            );
            state.hub.send(&session_id, ServerFrame::thinking(false));
        }
        Err(e) => {
            tracing::warn!(%session_id, %message_id, "chat failed: {:#}", e);
            state.hub.send(&session_id, ServerFrame::thinking(false));
            push(&state, &session_id, ChatMessage::error(&format!("{:#}", e)), true);
        }
    }
}
