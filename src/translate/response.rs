//! Buffered chat-completion responses.
//!
//! The backend's JSON is parsed leniently: only `choices[].message` is
//! required. Fields the caller's protocol needs but the backend omitted are
//! filled with stable placeholders so that identical backend output always
//! produces identical bytes. Token usage is never invented.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Fingerprint;
use crate::error::ShimError;
use crate::translate::PLACEHOLDER_CREATED;

/// Placeholder id for responses the backend did not label.
pub const PLACEHOLDER_RESPONSE_ID: &str = "chatcmpl-shim";

/// Token counters, passed through field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BackendChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<BackendChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct BackendChoice {
    #[serde(default)]
    index: Option<u32>,
    message: BackendMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackendMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<Value>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Chat completion response (non-streaming), as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub system_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatResponse {
    /// Translate a successful backend body.
    ///
    /// `requested_model` is used only when the backend does not name the model.
    pub fn from_backend(
        body: &[u8],
        requested_model: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Self, ShimError> {
        let backend: BackendChatResponse = serde_json::from_slice(body).map_err(|e| {
            ShimError::BackendError(format!("unparseable chat completion response: {e}"))
        })?;
        if backend.choices.is_empty() {
            return Err(ShimError::BackendError(
                "chat completion response has no choices".to_string(),
            ));
        }

        let choices = backend
            .choices
            .into_iter()
            .enumerate()
            .map(|(position, choice)| ChatChoice {
                index: choice.index.unwrap_or(position as u32),
                message: ResponseMessage {
                    role: choice.message.role.unwrap_or_else(|| "assistant".to_string()),
                    content: choice.message.content,
                    tool_calls: choice.message.tool_calls,
                    extra: choice.message.extra,
                },
                finish_reason: choice.finish_reason,
            })
            .collect();

        Ok(ChatResponse {
            id: backend
                .id
                .unwrap_or_else(|| PLACEHOLDER_RESPONSE_ID.to_string()),
            object: "chat.completion".to_string(),
            created: backend.created.unwrap_or(PLACEHOLDER_CREATED),
            model: backend
                .model
                .unwrap_or_else(|| requested_model.to_string()),
            choices,
            usage: backend.usage,
            system_fingerprint: fingerprint.0.clone(),
        })
    }

    /// Text of the first choice.
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
    }
}
