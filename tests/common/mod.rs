//! Shared fixtures: in-process mock backend routers and a shim under test.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use lm_shim::config::Config;
use lm_shim::server::openai_api::{build_router, AppState};

/// Serve `app` on an ephemeral loopback port and return its base URL.
pub async fn spawn_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A base URL nothing is listening on.
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Shim configuration pointing at `backend_url`.
pub fn shim_config(backend_url: &str) -> Config {
    let mut config = Config::default();
    config.server.port = Some(1234);
    config.backend.base_url = backend_url.to_string();
    config.backend.connect_timeout_secs = 2;
    config.backend.request_timeout_secs = 5;
    config.backend.models_timeout_secs = 5;
    config.backend.stream_idle_timeout_secs = 5;
    config
}

/// Start a shim with `config` and return its base URL.
pub async fn spawn_shim_with(config: Config) -> String {
    config.validate().unwrap();
    let state = Arc::new(AppState::new(Arc::new(config)).unwrap());
    spawn_server(build_router(state)).await
}

pub async fn spawn_shim(backend_url: &str) -> String {
    spawn_shim_with(shim_config(backend_url)).await
}

/// Counts backend hits and keeps every received JSON body.
#[derive(Default)]
pub struct Recorder {
    calls: AtomicUsize,
    bodies: Mutex<Vec<Value>>,
}

impl Recorder {
    pub fn hit(&self, body: Option<Value>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(body) = body {
            self.bodies.lock().unwrap().push(body);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> Option<Value> {
        self.bodies.lock().unwrap().last().cloned()
    }
}

/// One OpenAI streaming chunk carrying `content`.
pub fn content_chunk(content: &str) -> String {
    json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "demo",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    })
    .to_string()
}

/// SSE frame for a data payload.
pub fn sse_frame(data: &str) -> String {
    format!("data: {data}\n\n")
}

/// An event read back from the shim's SSE output.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Split an SSE body into events.
pub fn parse_sse(body: &str) -> Vec<SseEvent> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut event = None;
            let mut data = Vec::new();
            for line in block.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    event = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data.push(v.strip_prefix(' ').unwrap_or(v).to_string());
                }
            }
            if data.is_empty() {
                None
            } else {
                Some(SseEvent {
                    event,
                    data: data.join("\n"),
                })
            }
        })
        .collect()
}

/// `choices[0].delta.content` of a relayed chunk.
pub fn delta_content(event: &SseEvent) -> String {
    let value: Value = serde_json::from_str(&event.data).unwrap();
    value["choices"][0]["delta"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

pub fn chat_body(stream: bool) -> Value {
    json!({
        "model": "demo",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream
    })
}
