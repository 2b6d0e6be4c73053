//! Streamed chat completions: ordering, termination, failures, cancellation.

mod common;

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;

use common::{
    chat_body, content_chunk, delta_content, parse_sse, shim_config, spawn_server, spawn_shim,
    spawn_shim_with, sse_frame,
};

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(body)
        .unwrap()
}

/// Backend that streams the given raw SSE text in one go.
async fn sse_backend(raw: String) -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let raw = raw.clone();
            async move { sse_response(Body::from(raw)) }
        }),
    );
    spawn_server(app).await
}

async fn post_stream(shim: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{shim}/v1/chat/completions"))
        .json(&chat_body(true))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_chunks_relayed_in_order_with_single_done() {
    let words = ["The", " quick", " brown", " fox", " jumps"];
    let mut raw: String = words.iter().map(|w| sse_frame(&content_chunk(w))).collect();
    raw.push_str(&sse_frame("[DONE]"));
    let shim = spawn_shim(&sse_backend(raw).await).await;

    let response = post_stream(&shim).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = parse_sse(&response.text().await.unwrap());
    assert_eq!(events.len(), words.len() + 1);

    let relayed: Vec<String> = events[..words.len()].iter().map(delta_content).collect();
    assert_eq!(relayed, words);

    let done: Vec<_> = events.iter().filter(|e| e.data == "[DONE]").collect();
    assert_eq!(done.len(), 1);
    assert_eq!(events.last().unwrap().data, "[DONE]");
    assert!(events.iter().all(|e| e.event.is_none()));
}

#[tokio::test]
async fn test_chunks_carry_fingerprint() {
    let raw = format!("{}{}", sse_frame(&content_chunk("x")), sse_frame("[DONE]"));
    let shim = spawn_shim(&sse_backend(raw).await).await;

    let events = parse_sse(&post_stream(&shim).await.text().await.unwrap());
    let chunk: Value = serde_json::from_str(&events[0].data).unwrap();
    assert_eq!(chunk["system_fingerprint"], "lm-shim");
    assert_eq!(chunk["id"], "chatcmpl-upstream");
}

#[tokio::test]
async fn test_clean_close_without_done_still_terminates_once() {
    let raw = format!("{}{}", sse_frame(&content_chunk("a")), sse_frame(&content_chunk("b")));
    let shim = spawn_shim(&sse_backend(raw).await).await;

    let events = parse_sse(&post_stream(&shim).await.text().await.unwrap());
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].data, "[DONE]");
}

#[tokio::test]
async fn test_backend_error_before_streaming_is_plain_envelope() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "router exploded") }),
    );
    let shim = spawn_shim(&spawn_server(app).await).await;

    let response = post_stream(&shim).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("application/json"));
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["error"]["kind"], "backend_error");
}

#[tokio::test]
async fn test_stalled_error_body_before_streaming_times_out() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let partial = stream::once(async { Ok::<_, Infallible>(Bytes::from_static(b"{\"error\":")) });
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header("content-type", "application/json")
                .body(Body::from_stream(partial.chain(stream::pending())))
                .unwrap()
        }),
    );
    let mut config = shim_config(&spawn_server(app).await);
    config.backend.request_timeout_secs = 1;
    let shim = spawn_shim_with(config).await;

    let response = tokio::time::timeout(Duration::from_secs(8), post_stream(&shim))
        .await
        .expect("opening a stream must be bounded");
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["error"]["kind"], "upstream_timeout");
}

#[tokio::test]
async fn test_mid_stream_drop_ends_with_error_marker() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let body = stream::unfold(0u8, |step| async move {
                match step {
                    0 => Some((Ok(Bytes::from(sse_frame(&content_chunk("partial")))), 1)),
                    1 => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Some((Err(std::io::Error::other("backend crashed")), 2))
                    }
                    _ => None,
                }
            });
            sse_response(Body::from_stream(body))
        }),
    );
    let shim = spawn_shim(&spawn_server(app).await).await;

    let events = parse_sse(&post_stream(&shim).await.text().await.unwrap());
    assert_eq!(events.len(), 2);
    assert_eq!(delta_content(&events[0]), "partial");

    assert_eq!(events[1].event.as_deref(), Some("error"));
    let envelope: Value = serde_json::from_str(&events[1].data).unwrap();
    assert_eq!(envelope["error"]["kind"], "backend_unreachable");
    assert!(events.iter().all(|e| e.data != "[DONE]"));
}

#[tokio::test]
async fn test_upstream_error_chunk_ends_with_error_marker() {
    let raw = format!(
        "{}{}{}",
        sse_frame(&content_chunk("a")),
        sse_frame(r#"{"error":{"message":"provider overloaded"}}"#),
        sse_frame("[DONE]")
    );
    let shim = spawn_shim(&sse_backend(raw).await).await;

    let events = parse_sse(&post_stream(&shim).await.text().await.unwrap());
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].event.as_deref(), Some("error"));
    let envelope: Value = serde_json::from_str(&events[1].data).unwrap();
    assert_eq!(envelope["error"]["kind"], "backend_error");
}

#[tokio::test]
async fn test_stalled_stream_times_out() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let first = stream::once(async {
                Ok::<_, Infallible>(Bytes::from(sse_frame(&content_chunk("only"))))
            });
            sse_response(Body::from_stream(first.chain(stream::pending())))
        }),
    );
    let mut config = shim_config(&spawn_server(app).await);
    config.backend.stream_idle_timeout_secs = 1;
    let shim = spawn_shim_with(config).await;

    let body = tokio::time::timeout(Duration::from_secs(10), post_stream(&shim).await.text())
        .await
        .expect("stalled stream must be cut off")
        .unwrap();
    let events = parse_sse(&body);
    assert_eq!(events.len(), 2);
    assert_eq!(delta_content(&events[0]), "only");
    let envelope: Value = serde_json::from_str(&events[1].data).unwrap();
    assert_eq!(envelope["error"]["kind"], "upstream_timeout");
}

/// Fires its sender when the backend drops the response body.
struct DropSignal(Option<oneshot::Sender<()>>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

#[tokio::test]
async fn test_caller_disconnect_cancels_backend_stream() {
    let (closed_tx, closed_rx) = oneshot::channel();
    let closed_tx = Arc::new(Mutex::new(Some(closed_tx)));

    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let signal = DropSignal(closed_tx.lock().unwrap().take());
            async move {
                let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(1);
                tokio::spawn(async move {
                    let _signal = signal;
                    let mut n = 0u64;
                    loop {
                        let frame = sse_frame(&content_chunk(&format!("tick{n}")));
                        if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                            break;
                        }
                        n += 1;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                });
                sse_response(Body::from_stream(ReceiverStream::new(rx)))
            }
        }),
    );
    let shim = spawn_shim(&spawn_server(app).await).await;

    let mut response = post_stream(&shim).await;
    assert_eq!(response.status(), StatusCode::OK);
    let first = response.chunk().await.unwrap().expect("at least one chunk");
    assert!(String::from_utf8_lossy(&first).contains("tick"));
    drop(response);

    tokio::time::timeout(Duration::from_secs(5), closed_rx)
        .await
        .expect("backend stream was not cancelled after the caller left")
        .unwrap();
}
