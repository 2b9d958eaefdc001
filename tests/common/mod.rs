#![allow(dead_code)]

use agentx::config::Config;
use agentx::tools::{Tool, ToolArgs, ToolRegistry};
use agentx::{router, AppState};
use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

/// Looks up a fixed fact.
pub struct Lookup;

#[async_trait]
impl Tool for Lookup {
    fn name(&self) -> &str {
        "lookup"
    }

    fn description(&self) -> &str {
        "Look up a stored fact"
    }

    fn inputs(&self) -> Value {
        json!({"key": {"type": "string", "description": "Fact name"}})
    }

    async fn forward(&self, args: &ToolArgs) -> Result<String> {
        match args.get("key").and_then(Value::as_str) {
            Some("answer") => Ok("42".to_string()),
            _ => Ok("unknown".to_string()),
        }
    }
}

pub fn test_config(dir: &Path, ollama_url: &str) -> Config {
    let mut config = Config::default();
    config.server.artifacts_dir = dir.join("artifacts");
    config.tools.workspace_root = dir.join("workspace");
    config.providers.ollama_base_url = ollama_url.to_string();
    config
}

pub fn test_state(dir: &Path, ollama_url: &str) -> AppState {
    let mut tools = ToolRegistry::new();
    tools.add(Arc::new(Lookup));
    AppState::with_tools(test_config(dir, ollama_url), reqwest::Client::new(), tools)
}

/// Serve a router on an ephemeral port.
pub async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub async fn spawn_app(state: AppState) -> SocketAddr {
    spawn(router(state)).await
}

pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).to_string())
        })
    };
    (status, body)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}
