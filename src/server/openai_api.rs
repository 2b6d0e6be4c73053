//! LM Studio compatible HTTP API.
//!
//! Routes:
//! - GET /v1/models, GET /api/v0/models
//! - POST /v1/chat/completions, POST /api/v0/chat/completions
//!
//! Anything else, and bodies axum refuses to buffer, are answered with the
//! error envelope.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::BackendClient;
use crate::config::Config;
use crate::error::ShimError;
use crate::server::streaming::{relay_events, StreamContext};
use crate::translate::catalog::ModelList;
use crate::translate::request::{IncomingChatRequest, OutgoingChatRequest};

/// Largest accepted request body. Chat histories get long.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Application state shared across handlers. Read-only after startup.
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: BackendClient,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            backend: BackendClient::new(config.clone())?,
            config,
        })
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/api/v0/chat/completions", post(chat_completions))
        .route("/api/v0/models", get(list_models))
        .fallback(unknown_route)
        .method_not_allowed_fallback(wrong_method)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelList>, ShimError> {
    info!("Model listing request");

    match state.backend.list_models().await {
        Ok(models) => {
            info!(models = models.data.len(), "Model catalog fetched");
            Ok(Json(models))
        }
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "Model listing failed");
            Err(e)
        }
    }
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            let status = rejection.status();
            let err = ShimError::InvalidRequest(rejection.body_text());
            warn!(
                request_id = %request_id,
                status = status.as_u16(),
                error = %err,
                "Unreadable request body"
            );
            return (status, Json(err.envelope())).into_response();
        }
    };

    let outgoing = match IncomingChatRequest::from_slice(&body)
        .and_then(|incoming| incoming.into_outgoing(&state.config.compat))
    {
        Ok(outgoing) => outgoing,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Rejected chat completion request");
            return e.into_response();
        }
    };

    info!(
        request_id = %request_id,
        model = %outgoing.model,
        messages = outgoing.messages.len(),
        stream = outgoing.stream,
        "Chat completion request"
    );

    let result = if outgoing.stream {
        stream_completion(&state, &outgoing, request_id.clone()).await
    } else {
        state
            .backend
            .chat_completion(&outgoing)
            .await
            .map(|response| Json(response).into_response())
    };

    result.unwrap_or_else(|e| {
        error!(request_id = %request_id, kind = %e.kind(), error = %e, "Chat completion failed");
        e.into_response()
    })
}

/// Open the backend stream and hand its body to the relay.
///
/// Failures before the backend answers produce a plain error response; no
/// event stream is started.
async fn stream_completion(
    state: &AppState,
    outgoing: &OutgoingChatRequest,
    request_id: String,
) -> Result<Response, ShimError> {
    let upstream = state.backend.open_stream(outgoing).await?;

    let ctx = StreamContext {
        request_id,
        model: outgoing.model.clone(),
        fingerprint: state.config.fingerprint.clone(),
        idle_timeout: state.config.backend.stream_idle_timeout(),
    };
    let events = relay_events(upstream.bytes_stream(), ctx);

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn unknown_route(method: Method, uri: Uri) -> Response {
    let err = ShimError::InvalidRequest(format!("no route for {method} {}", uri.path()));
    (StatusCode::NOT_FOUND, Json(err.envelope())).into_response()
}

async fn wrong_method(method: Method, uri: Uri) -> Response {
    let err = ShimError::InvalidRequest(format!("{method} not allowed on {}", uri.path()));
    (StatusCode::METHOD_NOT_ALLOWED, Json(err.envelope())).into_response()
}
