//! HTTP client for the backend model router.
//!
//! All calls go through one pooled `reqwest::Client`. Non-success statuses
//! and transport failures come back as [`ShimError`] so the handlers never see
//! a raw reqwest error.

use std::sync::Arc;

use reqwest::{Client, Response};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ShimError;
use crate::translate::catalog::ModelList;
use crate::translate::request::OutgoingChatRequest;
use crate::translate::response::ChatResponse;

const MODELS_PATH: &str = "/v1/models";
const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Client for the backend router.
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    config: Arc<Config>,
}

impl BackendClient {
    pub fn new(config: Arc<Config>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(config.backend.connect_timeout())
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self { client, config })
    }

    /// Fetch and translate the backend's model catalog.
    pub async fn list_models(&self) -> Result<ModelList, ShimError> {
        let url = self.config.backend.endpoint(MODELS_PATH);
        debug!(url = %url, "Fetching model catalog");

        let response = self
            .client
            .get(&url)
            .timeout(self.config.backend.models_timeout())
            .send()
            .await
            .map_err(|e| ShimError::from_transport(&e))?;
        let response = ensure_success(response).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ShimError::from_transport(&e))?;

        ModelList::from_backend(&body, &self.config.catalog)
    }

    /// Issue a buffered chat completion and translate the result.
    pub async fn chat_completion(
        &self,
        request: &OutgoingChatRequest,
    ) -> Result<ChatResponse, ShimError> {
        let url = self.config.backend.endpoint(CHAT_COMPLETIONS_PATH);
        debug!(url = %url, model = %request.model, "Forwarding buffered chat completion");

        let response = self
            .client
            .post(&url)
            .timeout(self.config.backend.request_timeout())
            .json(request)
            .send()
            .await
            .map_err(|e| ShimError::from_transport(&e))?;
        let response = ensure_success(response).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ShimError::from_transport(&e))?;

        ChatResponse::from_backend(&body, &request.model, &self.config.fingerprint)
    }

    /// Open a streaming chat completion.
    ///
    /// Resolves once the backend has answered with a success status; the
    /// body is left unread for the relay. The wait for headers, and for the
    /// body of an error status, is bounded here; the relay bounds each chunk.
    pub async fn open_stream(&self, request: &OutgoingChatRequest) -> Result<Response, ShimError> {
        let url = self.config.backend.endpoint(CHAT_COMPLETIONS_PATH);
        debug!(url = %url, model = %request.model, "Opening chat completion stream");

        let send = self
            .client
            .post(&url)
            .header("accept", "text/event-stream")
            .json(request)
            .send();
        let opening = async {
            let response = send.await.map_err(|e| ShimError::from_transport(&e))?;
            ensure_success(response).await
        };

        tokio::time::timeout(self.config.backend.request_timeout(), opening)
            .await
            .map_err(|_| {
                ShimError::UpstreamTimeout(format!(
                    "stream not opened within {}s",
                    self.config.backend.request_timeout_secs
                ))
            })?
    }
}

/// Turn a non-success response into `backend_error`, reading its body for
/// the message.
async fn ensure_success(response: Response) -> Result<Response, ShimError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let err = ShimError::from_backend_status(status.as_u16(), &body);
    warn!(status = status.as_u16(), error = %err, "Backend router returned an error");
    Err(err)
}
