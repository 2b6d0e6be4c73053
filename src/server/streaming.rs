//! SSE relay for token-by-token responses.
//!
//! The backend's event stream is decoded event by event and every `data:`
//! payload is reframed and handed to the caller before the next network read.
//! The idle timeout runs per relayed payload, so keep-alive comments alone do
//! not keep a stalled stream open.
//! A relay ends exactly once, either with `[DONE]` or with an `error` event
//! carrying the error envelope.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::Event;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::Fingerprint;
use crate::error::ShimError;
use crate::translate::PLACEHOLDER_CREATED;

/// Terminal sentinel in the OpenAI streaming format.
pub const DONE_MARKER: &str = "[DONE]";

/// Incremental decoder for `text/event-stream` bodies.
///
/// The `data:` lines of one event are joined with `\n` and yielded when the
/// blank line ending the event arrives. Comments and other fields (`event:`,
/// `id:`, `retry:`) are dropped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// End of input: terminate a trailing line and dispatch the pending event.
    pub fn finish(&mut self) {
        if !self.buf.is_empty() || !self.data.is_empty() {
            self.buf.extend_from_slice(b"\n\n");
        }
    }

    /// Next complete event payload, if one is buffered.
    pub fn next_data(&mut self) -> Option<String> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(&['\n', '\r'][..]);

            if line.is_empty() {
                if !self.data.is_empty() {
                    let payload = self.data.join("\n");
                    self.data.clear();
                    return Some(payload);
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        None
    }
}

/// One unit handed to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A reframed chunk (JSON text).
    Chunk(String),
    /// Clean end of stream.
    Done,
    /// Interrupted stream.
    Error(ShimError),
}

impl Frame {
    pub fn into_event(self) -> Event {
        match self {
            Frame::Chunk(data) => Event::default().data(data),
            Frame::Done => Event::default().data(DONE_MARKER),
            Frame::Error(err) => Event::default()
                .event("error")
                .data(serde_json::to_string(&err.envelope()).unwrap_or_default()),
        }
    }
}

/// Per-request values the relay stamps onto chunks.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub request_id: String,
    pub model: String,
    pub fingerprint: Fingerprint,
    pub idle_timeout: Duration,
}

impl StreamContext {
    fn chunk_id(&self) -> String {
        format!("chatcmpl-{}", self.request_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Streaming,
    Completed,
    Errored,
}

struct RelayState {
    upstream: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    decoder: SseDecoder,
    ctx: StreamContext,
    phase: RelayPhase,
    upstream_closed: bool,
    relayed: usize,
}

impl RelayState {
    /// Reframe one upstream payload. `None` means nothing to forward.
    fn reframe(&self, data: &str) -> Option<Frame> {
        let data = data.trim();
        if data.is_empty() {
            return None;
        }
        if data == DONE_MARKER {
            return Some(Frame::Done);
        }

        match serde_json::from_str::<Value>(data) {
            Ok(Value::Object(mut chunk)) => {
                if let Some(err) = chunk.get("error").filter(|err| !err.is_null()) {
                    let message = err
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| err.to_string());
                    return Some(Frame::Error(ShimError::BackendError(format!(
                        "stream interrupted: {message}"
                    ))));
                }

                chunk
                    .entry("id")
                    .or_insert_with(|| Value::String(self.ctx.chunk_id()));
                chunk
                    .entry("object")
                    .or_insert_with(|| Value::String("chat.completion.chunk".to_string()));
                chunk
                    .entry("created")
                    .or_insert_with(|| Value::from(PLACEHOLDER_CREATED));
                chunk
                    .entry("model")
                    .or_insert_with(|| Value::String(self.ctx.model.clone()));
                chunk.insert(
                    "system_fingerprint".to_string(),
                    Value::String(self.ctx.fingerprint.0.clone()),
                );
                Some(Frame::Chunk(Value::Object(chunk).to_string()))
            }
            _ => {
                warn!(
                    request_id = %self.ctx.request_id,
                    "Could not parse upstream chunk, passing through"
                );
                Some(Frame::Chunk(data.replace('\r', "")))
            }
        }
    }

    fn observe(&mut self, frame: &Frame) {
        match frame {
            Frame::Chunk(_) => self.relayed += 1,
            Frame::Done => {
                self.phase = RelayPhase::Completed;
                info!(
                    request_id = %self.ctx.request_id,
                    chunks = self.relayed,
                    "Stream completed"
                );
            }
            Frame::Error(err) => {
                self.phase = RelayPhase::Errored;
                warn!(
                    request_id = %self.ctx.request_id,
                    chunks = self.relayed,
                    kind = %err.kind(),
                    error = %err,
                    "Stream interrupted"
                );
            }
        }
    }
}

impl Drop for RelayState {
    fn drop(&mut self) {
        if self.phase == RelayPhase::Streaming {
            info!(
                request_id = %self.ctx.request_id,
                chunks = self.relayed,
                "Caller disconnected mid-stream, closing backend stream"
            );
        }
    }
}

/// Relay an upstream SSE byte stream as caller-facing frames.
///
/// Dropping the returned stream drops the upstream body, which closes the
/// backend connection.
pub fn relay<S>(upstream: S, ctx: StreamContext) -> impl Stream<Item = Frame>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = RelayState {
        upstream: upstream.boxed(),
        decoder: SseDecoder::default(),
        ctx,
        phase: RelayPhase::Streaming,
        upstream_closed: false,
        relayed: 0,
    };

    stream::unfold(state, |mut st| async move {
        if st.phase != RelayPhase::Streaming {
            return None;
        }
        let deadline = Instant::now() + st.ctx.idle_timeout;

        loop {
            if let Some(data) = st.decoder.next_data() {
                if let Some(frame) = st.reframe(&data) {
                    st.observe(&frame);
                    return Some((frame, st));
                }
                continue;
            }

            if st.upstream_closed {
                debug!(request_id = %st.ctx.request_id, "Upstream closed without [DONE]");
                let frame = Frame::Done;
                st.observe(&frame);
                return Some((frame, st));
            }

            let frame = match timeout_at(deadline, st.upstream.next()).await {
                Ok(Some(Ok(bytes))) => {
                    st.decoder.push(&bytes);
                    continue;
                }
                Ok(Some(Err(e))) => Frame::Error(ShimError::from_transport(&e)),
                Ok(None) => {
                    st.decoder.finish();
                    st.upstream_closed = true;
                    continue;
                }
                Err(_) => Frame::Error(ShimError::UpstreamTimeout(format!(
                    "no chunk within {:?}",
                    st.ctx.idle_timeout
                ))),
            };
            st.observe(&frame);
            return Some((frame, st));
        }
    })
}

/// [`relay`] mapped to axum SSE events.
pub fn relay_events<S>(
    upstream: S,
    ctx: StreamContext,
) -> impl Stream<Item = Result<Event, Infallible>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    relay(upstream, ctx).map(|frame| Ok(frame.into_event()))
}
