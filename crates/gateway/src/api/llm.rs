//! LLM proxy — `POST /llm/generate`.
//!
//! Forwards `{messages, model?, temperature?}` to the configured provider
//! and returns `{content}`. Lets browser front-ends and scenario tooling
//! reuse the server's provider credentials.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use parley_providers::{ChatMessage, GenerateRequest};

use crate::api::api_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

pub async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> impl IntoResponse {
    let Some(provider) = &state.llm else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "no LLM provider configured" })),
        )
            .into_response();
    };
    let request = GenerateRequest {
        messages: body.messages,
        model: body.model,
        temperature: body.temperature,
        max_tokens: None,
    };
    match provider.generate(&request).await {
        Ok(response) => Json(serde_json::json!({ "content": response.content })).into_response(),
        Err(e) => api_error(&e),
    }
}
