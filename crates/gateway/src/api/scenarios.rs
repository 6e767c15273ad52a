//! Scenario CRUD.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use parley_domain::Scenario;

use crate::api::api_error;
use crate::state::AppState;

pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    match state.orch.scenarios().list() {
        Ok(scenarios) => Json(serde_json::json!({ "scenarios": scenarios })).into_response(),
        Err(e) => api_error(&e),
    }
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.orch.scenarios().get_active(&id) {
        Ok(Some(scenario)) => Json(scenario).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("scenario '{id}' not found") })),
        )
            .into_response(),
        Err(e) => api_error(&e),
    }
}

pub async fn create(
    State(state): State<AppState>,
    Json(scenario): Json<Scenario>,
) -> impl IntoResponse {
    match state.orch.scenarios().insert(&scenario) {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "id": scenario.id() })),
        )
            .into_response(),
        Err(e) => api_error(&e),
    }
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(scenario): Json<Scenario>,
) -> impl IntoResponse {
    match state.orch.scenarios().update(&id, &scenario) {
        Ok(()) => Json(serde_json::json!({ "id": id })).into_response(),
        Err(e) => api_error(&e),
    }
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.orch.scenarios().delete(&id) {
        Ok(true) => Json(serde_json::json!({ "deleted": true })).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("scenario '{id}' not found") })),
        )
            .into_response(),
        Err(e) => api_error(&e),
    }
}
