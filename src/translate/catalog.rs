//! Model catalog translation.
//!
//! The backend reports OpenAI model objects; callers expect LM Studio style
//! descriptors with a handful of extra fields that only have placeholder
//! values here.

use serde::{Deserialize, Serialize};

use crate::config::CatalogConfig;
use crate::error::ShimError;
use crate::translate::PLACEHOLDER_CREATED;

#[derive(Debug, Deserialize)]
struct BackendModelList {
    data: Vec<BackendModel>,
}

#[derive(Debug, Deserialize)]
struct BackendModel {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    owned_by: Option<String>,
    #[serde(default)]
    created: Option<i64>,
}

/// Model listing response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelDescriptor>,
}

/// A single model as the caller expects to see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub object: String,
    pub r#type: String,
    pub publisher: String,
    pub owned_by: String,
    pub created: i64,
    pub arch: String,
    pub compatibility_type: String,
    pub quantization: String,
    pub state: String,
    pub max_context_length: u64,
}

impl ModelList {
    /// Translate the backend's `/v1/models` body.
    ///
    /// An unparseable body or an empty list is an error: an empty catalog
    /// would be indistinguishable from a backend with nothing configured.
    pub fn from_backend(body: &[u8], catalog: &CatalogConfig) -> Result<Self, ShimError> {
        let backend: BackendModelList = serde_json::from_slice(body)
            .map_err(|e| ShimError::BackendError(format!("unparseable model list: {e}")))?;
        if backend.data.is_empty() {
            return Err(ShimError::BackendError(
                "backend router returned no models".to_string(),
            ));
        }

        Ok(ModelList {
            object: "list".to_string(),
            data: backend
                .data
                .into_iter()
                .map(|model| ModelDescriptor::new(model, catalog))
                .collect(),
        })
    }
}

impl ModelDescriptor {
    fn new(model: BackendModel, catalog: &CatalogConfig) -> Self {
        let publisher = model
            .owned_by
            .unwrap_or_else(|| catalog.default_publisher.clone());
        Self {
            id: model
                .id
                .unwrap_or_else(|| catalog.default_model_alias.clone()),
            object: "model".to_string(),
            r#type: "chat".to_string(),
            owned_by: publisher.clone(),
            publisher,
            created: model.created.unwrap_or(PLACEHOLDER_CREATED),
            arch: "unknown".to_string(),
            compatibility_type: "openai".to_string(),
            quantization: "unknown".to_string(),
            state: "loaded".to_string(),
            max_context_length: catalog.max_context_length,
        }
    }
}
