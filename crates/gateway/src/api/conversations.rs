//! Conversation read endpoints.
//!
//! - `GET /conversations?limit&hours` — recent conversations
//! - `GET /conversations/:id?includeScenario` — full snapshot

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::api::api_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub hours: Option<u64>,
}

fn default_limit() -> usize {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    match state.orch.list_conversations(query.limit, query.hours) {
        Ok(rows) => Json(serde_json::json!({ "conversations": rows })).into_response(),
        Err(e) => api_error(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetQuery {
    #[serde(default)]
    pub include_scenario: bool,
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<GetQuery>,
) -> impl IntoResponse {
    match state.orch.snapshot(id, query.include_scenario) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => api_error(&e),
    }
}
