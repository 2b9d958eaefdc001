mod common;

use axum::routing::{get, post};
use axum::{Json, Router};
use common::{spawn, spawn_app, test_state};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ollama stand-in: asks for `lookup` first, then streams the answer in two chunks.
async fn fake_ollama(Json(body): Json<Value>) -> String {
    scripted_turn(&body, "")
}

/// Same script, but the tool request is preceded by some streamed text.
async fn chatty_ollama(Json(body): Json<Value>) -> String {
    scripted_turn(&body, "Let me check. ")
}

fn scripted_turn(body: &Value, preamble: &str) -> String {
    let last_role = body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["role"].as_str())
        .unwrap_or_default()
        .to_string();

    let lines = if last_role == "tool" {
        vec![
            json!({"message": {"role": "assistant", "content": "The answer "}, "done": false}),
            json!({"message": {"role": "assistant", "content": "is 42"}, "done": false}),
            json!({"message": {"role": "assistant", "content": ""}, "done": true}),
        ]
    } else {
        let mut lines = Vec::new();
        if !preamble.is_empty() {
            lines.push(json!({"message": {"role": "assistant", "content": preamble}, "done": false}));
        }
        lines.push(json!({
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": "lookup", "arguments": {"key": "answer"}}}]
            },
            "done": true
        }));
        lines
    };
    lines
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

async fn slow_ollama() -> String {
    tokio::time::sleep(Duration::from_millis(500)).await;
    json!({"message": {"role": "assistant", "content": "ok"}, "done": true}).to_string()
}

async fn stalled_ollama() -> String {
    tokio::time::sleep(Duration::from_secs(30)).await;
    String::new()
}

async fn new_session(addr: SocketAddr) -> String {
    let body: Value = reqwest::Client::new()
        .post(format!("http://{}/api/chat/new", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["session_id"].as_str().unwrap().to_string()
}

/// Connect and wait until the server has registered the socket.
async fn connect(addr: SocketAddr, session_id: &str) -> Socket {
    let (mut socket, _) = connect_async(format!("ws://{}/ws/chat/{}", addr, session_id))
        .await
        .unwrap();
    socket.send(Message::Text("ping".into())).await.unwrap();
    assert_eq!(next_frame(&mut socket).await, json!({"type": "pong"}));
    socket
}

async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), socket.next())
            .await
            .expect("frame timeout")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Frames up to and including the terminal message after `thinking:false`.
async fn collect_turn(socket: &mut Socket, ends_with_error: bool) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(socket).await;
        let done = if ends_with_error {
            frame["type"] == "message" && frame["content"]["id"].as_str().unwrap().starts_with("error-")
        } else {
            frame == json!({"type": "thinking", "value": false})
        };
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

async fn post_chat(addr: SocketAddr, session_id: &str, message: &str) -> Value {
    let response = reqwest::Client::new()
        .post(format!("http://{}/api/chat", addr))
        .json(&json!({
            "session_id": session_id,
            "provider": "ollama",
            "model": "mock",
            "message": message,
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    response.json().await.unwrap()
}

#[tokio::test]
async fn chat_turn_streams_frames_in_order() {
    let ollama = spawn(Router::new().route("/api/chat", post(fake_ollama))).await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), &format!("http://{}", ollama));
    let addr = spawn_app(state.clone()).await;

    let session_id = new_session(addr).await;
    let mut socket = connect(addr, &session_id).await;

    let reply = post_chat(addr, &session_id, "What is the answer?").await;
    assert_eq!(reply["status"], "success");
    let message_id = reply["message_id"].as_str().unwrap().to_string();
    let assistant_id = format!("assistant-{}", message_id);

    let frames = collect_turn(&mut socket, false).await;

    assert_eq!(frames[0], json!({"type": "thinking", "value": true}));
    assert_eq!(
        frames[1],
        json!({"type": "message", "content": {
            "id": format!("user-{}", message_id),
            "role": "user",
            "content": "What is the answer?",
            "is_streaming": false
        }})
    );

    let answers = &frames[2..frames.len() - 1];
    let (last, streaming) = answers.split_last().unwrap();
    assert!(!streaming.is_empty());
    for frame in streaming {
        assert_eq!(frame["content"]["id"], assistant_id.as_str());
        assert_eq!(frame["content"]["is_streaming"], true);
    }
    assert_eq!(streaming.last().unwrap()["content"]["content"], "The answer is 42");
    assert_eq!(
        last["content"],
        json!({
            "id": assistant_id,
            "role": "assistant",
            "content": "The answer is 42",
            "is_streaming": false
        })
    );

    let transcript = state.sessions.transcript(&session_id).unwrap();
    let ids: Vec<_> = transcript.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec![format!("user-{}", message_id), assistant_id.clone()]);

    // The conversation context carries over to the next turn.
    let context = state.sessions.context(&session_id).unwrap();
    let roles: Vec<_> = context.raw_messages().iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);
    assert!(!state.sessions.get(&session_id).unwrap().lock().unwrap().is_busy());
}

#[tokio::test]
async fn text_before_a_tool_call_is_replaced_by_the_answer() {
    let ollama = spawn(Router::new().route("/api/chat", post(chatty_ollama))).await;
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_app(test_state(dir.path(), &format!("http://{}", ollama))).await;

    let session_id = new_session(addr).await;
    let mut socket = connect(addr, &session_id).await;
    post_chat(addr, &session_id, "q").await;

    let frames = collect_turn(&mut socket, false).await;
    let bubbles: Vec<(String, bool)> = frames
        .iter()
        .filter(|f| f["type"] == "message" && f["content"]["role"] == "assistant")
        .map(|f| {
            (
                f["content"]["content"].as_str().unwrap().to_string(),
                f["content"]["is_streaming"].as_bool().unwrap(),
            )
        })
        .collect();

    assert_eq!(bubbles.first().unwrap(), &("Let me check. ".to_string(), true));
    assert_eq!(bubbles.last().unwrap(), &("The answer is 42".to_string(), false));
    let last_streamed = &bubbles[bubbles.len() - 2];
    assert_eq!(last_streamed, &("The answer is 42".to_string(), true));
    assert!(bubbles
        .iter()
        .all(|(content, _)| !content.starts_with("Let me check. The")));
}

#[tokio::test]
async fn clear_during_a_turn_is_not_undone() {
    let ollama = spawn(Router::new().route("/api/chat", post(slow_ollama))).await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), &format!("http://{}", ollama));
    let addr = spawn_app(state.clone()).await;

    let session_id = new_session(addr).await;
    let mut socket = connect(addr, &session_id).await;

    post_chat(addr, &session_id, "first").await;
    collect_turn(&mut socket, false).await;
    assert_eq!(state.sessions.context(&session_id).unwrap().len(), 2);

    post_chat(addr, &session_id, "slow").await;
    assert_eq!(next_frame(&mut socket).await["value"], true);
    assert_eq!(next_frame(&mut socket).await["content"]["role"], "user");

    let cleared = reqwest::Client::new()
        .post(format!("http://{}/api/chat/clear", addr))
        .json(&json!({"session_id": session_id}))
        .send()
        .await
        .unwrap();
    assert!(cleared.status().is_success());
    assert!(state.sessions.context(&session_id).unwrap().is_empty());

    let frames = collect_turn(&mut socket, false).await;
    assert!(frames.contains(&json!({"type": "thinking", "value": false})));
    assert!(state.sessions.context(&session_id).unwrap().is_empty());
    assert!(!state.sessions.get(&session_id).unwrap().lock().unwrap().is_busy());
}

#[tokio::test]
async fn cancelled_turn_reports_error() {
    let ollama = spawn(Router::new().route("/api/chat", post(stalled_ollama))).await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), &format!("http://{}", ollama));
    let addr = spawn_app(state.clone()).await;

    let session_id = new_session(addr).await;
    let mut socket = connect(addr, &session_id).await;
    post_chat(addr, &session_id, "hang").await;

    assert_eq!(next_frame(&mut socket).await["value"], true);
    assert_eq!(next_frame(&mut socket).await["content"]["role"], "user");

    reqwest::Client::new()
        .post(format!("http://{}/api/chat/cancel/{}", addr, session_id))
        .send()
        .await
        .unwrap();

    let frames = collect_turn(&mut socket, true).await;
    assert_eq!(frames[0], json!({"type": "thinking", "value": false}));
    let error = &frames.last().unwrap()["content"];
    assert_eq!(error["content"], "Error: Request cancelled");
    assert_eq!(error["role"], "assistant");

    // The slot is free again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(state.sessions.begin_request(&session_id).is_ok());
}

#[tokio::test]
async fn unknown_session_socket_is_closed_with_4004() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_app(test_state(dir.path(), "http://127.0.0.1:9")).await;

    let (mut socket, _) = connect_async(format!("ws://{}/ws/chat/not-a-session", addr))
        .await
        .unwrap();
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match message {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4004),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn newer_socket_takes_over_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_app(test_state(dir.path(), "http://127.0.0.1:9")).await;
    let session_id = new_session(addr).await;

    let mut first = connect(addr, &session_id).await;
    let _second = connect(addr, &session_id).await;

    // The replaced socket is closed by the server.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}

#[tokio::test]
async fn provider_failure_becomes_error_frame() {
    let dir = tempfile::tempdir().unwrap();
    let dead = spawn(Router::new().route("/", get(|| async { "nothing here" }))).await;
    let state = test_state(dir.path(), &format!("http://{}", dead));
    let addr = spawn_app(state).await;

    let session_id = new_session(addr).await;
    let mut socket = connect(addr, &session_id).await;
    post_chat(addr, &session_id, "hello").await;

    let frames = collect_turn(&mut socket, true).await;
    let error = &frames.last().unwrap()["content"];
    assert!(error["id"].as_str().unwrap().starts_with("error-"));
    assert!(error["content"].as_str().unwrap().starts_with("Error: "));
    assert!(frames.contains(&json!({"type": "thinking", "value": false})));
}
