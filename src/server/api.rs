use anyhow::Context as _;
use axum::extract::{Multipart, Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path as FsPath;

use super::AppState;
use crate::agent::AgentStatus;
use crate::error::{ApiError, ApiResult};
use crate::llm::{self, ModelInfo, ProviderKind};
use crate::tools::builtins::web::{SearchHit, WebSearchTool, DEFAULT_MAX_RESULTS};
use crate::tools::ToolInfo;
use crate::types::ChatMessage;

fn parse_provider(name: &str) -> ApiResult<ProviderKind> {
    name.parse()
        .map_err(|e: anyhow::Error| ApiError::BadRequest(e.to_string()))
}

fn success() -> Json<Value> {
    Json(json!({ "status": "success" }))
}

pub async fn new_chat(State(state): State<AppState>) -> Json<Value> {
    let context = state.agent_snapshot().new_context();
    let session_id = state.sessions.create(context);
    tracing::info!(%session_id, "new chat");
    Json(json!({ "session_id": session_id }))
}

#[derive(Debug, Serialize)]
pub struct History {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
}

pub async fn history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<History>> {
    let messages = state
        .sessions
        .transcript(&session_id)
        .ok_or(ApiError::SessionNotFound)?;
    Ok(Json(History {
        session_id,
        messages,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ClearRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn clear(
    State(state): State<AppState>,
    body: Option<Json<ClearRequest>>,
) -> ApiResult<Json<Value>> {
    let Json(request) = body.unwrap_or_default();
    if let Some(session_id) = request.session_id.filter(|id| !id.is_empty()) {
        state.sessions.clear(&session_id)?;
        tracing::info!(%session_id, "chat cleared");
    }
    Ok(success())
}

pub async fn models(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> ApiResult<Json<Vec<ModelInfo>>> {
    let kind = parse_provider(&provider)?;
    let models = llm::list_models(kind, &state.config.providers, state.client.clone()).await?;
    Ok(Json(models))
}

pub async fn tools(State(state): State<AppState>) -> Json<Vec<ToolInfo>> {
    Json(state.agent_snapshot().available_tools())
}

pub async fn status(State(state): State<AppState>) -> Json<AgentStatus> {
    Json(state.agent_snapshot().status())
}

#[derive(Debug, Deserialize)]
pub struct ProviderRequest {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Check credentials and, with a model, make it the default provider.
pub async fn set_provider(
    State(state): State<AppState>,
    Json(request): Json<ProviderRequest>,
) -> ApiResult<Json<Value>> {
    let kind = parse_provider(&request.provider)?;
    match request.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        Some(model) => {
            let provider =
                llm::create_provider(kind, model, &state.config.providers, state.client.clone())
                    .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;
            state.set_default_provider(provider);
            tracing::info!(provider = %kind, model, "default provider updated");
        }
        None => {
            llm::check_credentials(kind).map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?
        }
    }
    Ok(success())
}

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    pub provider: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_image_size")]
    pub size: String,
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

pub async fn generate_image(
    State(state): State<AppState>,
    Json(request): Json<ImageRequest>,
) -> ApiResult<Json<Value>> {
    let kind = parse_provider(&request.provider)?;
    if kind != ProviderKind::OpenAi {
        return Err(ApiError::BadRequest(
            "Image generation is only supported for OpenAI".to_string(),
        ));
    }
    if request.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("Prompt is required".to_string()));
    }
    llm::validate_image_size(&request.size).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    llm::check_credentials(kind).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let url = llm::generate_image(
        kind,
        &request.prompt,
        &request.size,
        &state.config.providers,
        state.client.clone(),
    )
    .await?;
    Ok(Json(json!({ "url": url })))
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub max_results: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

pub async fn web_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    if request.query.trim().is_empty() {
        return Err(ApiError::BadRequest("Query is required".to_string()));
    }
    let search = WebSearchTool::new(&state.config.tools.search_url, state.client.clone());
    let results = search
        .search(&request.query, request.max_results.unwrap_or(DEFAULT_MAX_RESULTS))
        .await?;
    Ok(Json(SearchResponse { results }))
}

#[derive(Debug, Serialize)]
pub struct Artifact {
    pub name: String,
    pub url: String,
}

impl Artifact {
    fn new(name: &str) -> Self {
        Artifact {
            name: name.to_string(),
            url: format!("/artifacts/{}", urlencoding::encode(name)),
        }
    }
}

/// Multipart upload (`file` field) into the artifacts directory.
pub async fn create_artifact(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field
            .file_name()
            .and_then(|n| FsPath::new(n).file_name())
            .and_then(|n| n.to_str())
            .filter(|n| !n.starts_with('.'))
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest("A file name is required".to_string()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        let dir = &state.config.server.artifacts_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .context("failed to create artifacts directory")?;
        tokio::fs::write(dir.join(&name), &bytes)
            .await
            .with_context(|| format!("failed to store artifact {}", name))?;

        tracing::info!(artifact = %name, size = bytes.len(), "artifact stored");
        let artifact = Artifact::new(&name);
        return Ok(Json(json!({
            "status": "success",
            "url": artifact.url,
            "name": artifact.name,
        })));
    }
    Err(ApiError::BadRequest("No file uploaded".to_string()))
}

pub async fn list_artifacts(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let dir = &state.config.server.artifacts_dir;
    let mut artifacts = Vec::new();

    if dir.is_dir() {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .context("failed to read artifacts directory")?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("failed to read artifacts directory")?
        {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                artifacts.push(Artifact::new(name));
            }
        }
    }

    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(json!({ "artifacts": artifacts })))
}
