//! Error taxonomy and the caller-facing error envelope.
//!
//! Every failure the shim can report falls into one of four kinds. The kind
//! decides the HTTP status and is echoed in the envelope so clients can branch
//! on it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest slice of a non-JSON backend body quoted in an error message.
const MAX_QUOTED_BODY: usize = 512;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    BackendUnreachable,
    BackendError,
    UpstreamTimeout,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::BackendUnreachable => "backend_unreachable",
            ErrorKind::BackendError => "backend_error",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::BackendUnreachable | ErrorKind::BackendError => StatusCode::BAD_GATEWAY,
            ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// OpenAI-style `type` value.
    fn openai_type(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request_error",
            _ => "server_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShimError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backend router unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Backend router error: {0}")]
    BackendError(String),

    #[error("Backend router timed out: {0}")]
    UpstreamTimeout(String),
}

impl ShimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShimError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ShimError::BackendUnreachable(_) => ErrorKind::BackendUnreachable,
            ShimError::BackendError(_) => ErrorKind::BackendError,
            ShimError::UpstreamTimeout(_) => ErrorKind::UpstreamTimeout,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind().status()
    }

    /// Classify a transport-level failure talking to the backend.
    ///
    /// Timeouts map to `upstream_timeout`; everything else reqwest can report
    /// (refused, DNS, reset, truncated body) maps to `backend_unreachable`.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ShimError::UpstreamTimeout(err.to_string())
        } else {
            ShimError::BackendUnreachable(err.to_string())
        }
    }

    /// Build a `backend_error` from a non-success backend response.
    pub fn from_backend_status(status: u16, body: &[u8]) -> Self {
        let detail = backend_error_message(body);
        if detail.is_empty() {
            ShimError::BackendError(format!("status {status}"))
        } else {
            ShimError::BackendError(format!("status {status}: {detail}"))
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let kind = self.kind();
        ErrorEnvelope {
            error: ErrorDetail {
                kind,
                message: self.to_string(),
                r#type: kind.openai_type().to_string(),
                code: kind.as_str().to_string(),
            },
        }
    }
}

/// Pull a readable message out of a backend error body.
///
/// OpenAI-style `{"error":{"message":..}}` and `{"detail":..}` bodies yield
/// their message; anything else is quoted raw, truncated.
fn backend_error_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        let message = value
            .pointer("/error/message")
            .or_else(|| value.get("error"))
            .or_else(|| value.get("detail"))
            .and_then(|v| v.as_str());
        if let Some(message) = message {
            return message.to_string();
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(MAX_QUOTED_BODY) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Error body returned to callers, in OpenAI shape with an explicit kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    pub r#type: String,
    pub code: String,
}

impl IntoResponse for ShimError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.envelope())).into_response()
    }
}
