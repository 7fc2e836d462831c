//! OpenAI-compatible /v1/models endpoint.

use std::sync::Arc;

use axum::{extract::State, middleware, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::require_auth;
use crate::AppState;

/// Model entry in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// Response from /v1/models endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelObject>,
}

impl ModelsResponse {
    fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            object: "list".to_string(),
            data: ids
                .into_iter()
                .map(|id| ModelObject {
                    id,
                    object: "model".to_string(),
                    created: 0,
                    owned_by: "mindgateway".to_string(),
                })
                .collect(),
        }
    }
}

/// GET /v1/models - Models served by at least one healthy worker
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let models = state.registry.snapshot().await.healthy_models();
    Json(ModelsResponse::from_ids(models))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/models", get(list_models))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_response_serialization() {
        let response = ModelsResponse::from_ids(vec!["llama2".to_string(), "mistral".to_string()]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["id"], "llama2");
        assert_eq!(json["data"][1]["object"], "model");
        assert_eq!(json["data"].as_array().unwrap().len(), 2);
    }
}
