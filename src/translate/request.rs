//! Incoming chat-completion requests and their backend-facing form.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::CompatConfig;
use crate::error::ShimError;

/// Marker some clients put in user turns that are really system prompts.
const SYSTEM_MARKER: &str = "This is a system message.";

/// User turn appended when a conversation has only system messages.
const CONTINUE_PROMPT: &str = "Please continue.";

/// `max_tokens` value meaning "no limit".
const UNLIMITED_MAX_TOKENS: i64 = -1;

/// A single chat message.
///
/// Only `role` and `tool_calls` are interpreted; everything else, including
/// `content`, travels untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert("content".to_string(), Value::String(content.into()));
        Self {
            role: role.into(),
            tool_calls: None,
            extra,
        }
    }

    /// Text content, when it is a plain string rather than a list of parts.
    pub fn text(&self) -> Option<&str> {
        self.extra.get("content").and_then(Value::as_str)
    }
}

/// Chat completion request as sent by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingChatRequest {
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,

    #[serde(default)]
    pub stream: Option<bool>,

    #[serde(default)]
    pub max_tokens: Option<i64>,

    #[serde(default)]
    pub tools: Option<Vec<Value>>,

    /// Remaining generation parameters (temperature, top_p, stop, ...).
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl IncomingChatRequest {
    /// Parse a raw request body.
    ///
    /// Shape problems are reported as `invalid_request`; semantic checks are
    /// left to [`IncomingChatRequest::into_outgoing`].
    pub fn from_slice(body: &[u8]) -> Result<Self, ShimError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ShimError::InvalidRequest(format!("body is not valid JSON: {e}")))?;
        if !value.is_object() {
            return Err(ShimError::InvalidRequest(
                "body must be a JSON object".to_string(),
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| ShimError::InvalidRequest(format!("malformed request: {e}")))
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Validate and reshape for the backend router.
    pub fn into_outgoing(self, compat: &CompatConfig) -> Result<OutgoingChatRequest, ShimError> {
        let model = match self.model {
            Some(model) if !model.trim().is_empty() => model,
            Some(_) => return Err(ShimError::InvalidRequest("`model` is empty".to_string())),
            None => return Err(ShimError::InvalidRequest("`model` is required".to_string())),
        };
        let messages = match self.messages {
            Some(messages) if !messages.is_empty() => messages,
            _ => {
                return Err(ShimError::InvalidRequest(
                    "`messages` must be a non-empty list".to_string(),
                ))
            }
        };

        let messages = tidy_messages(messages, compat);
        let max_tokens = self.max_tokens.filter(|&n| n != UNLIMITED_MAX_TOKENS);
        let tools = self.tools.filter(|tools| !tools.is_empty());

        Ok(OutgoingChatRequest {
            model,
            messages,
            stream: self.stream.unwrap_or(false),
            max_tokens,
            tools,
            params: self.params,
        })
    }
}

/// Chat completion request as sent to the backend router.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

fn tidy_messages(messages: Vec<ChatMessage>, compat: &CompatConfig) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = messages
        .into_iter()
        .map(|message| tidy_message(message, compat))
        .collect();

    if compat.ensure_user_turn && messages.iter().all(|m| m.role == "system") {
        tracing::debug!("Only system messages present, appending user turn");
        messages.push(ChatMessage::new("user", CONTINUE_PROMPT));
    }
    messages
}

fn tidy_message(mut message: ChatMessage, compat: &CompatConfig) -> ChatMessage {
    if compat.strip_tool_calls {
        let drop = match &message.tool_calls {
            Some(calls) => message.role != "assistant" || calls.is_empty(),
            None => false,
        };
        if drop {
            message.tool_calls = None;
        }
    }

    if compat.promote_system_marker
        && message.role == "user"
        && message.text().is_some_and(|t| t.contains(SYSTEM_MARKER))
    {
        message.role = "system".to_string();
    }
    message
}
