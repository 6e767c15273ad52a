//! Attachment download.
//!
//! `GET /attachments/:id/content` returns the raw bytes with the stored
//! content type. Inline expansion elsewhere (the MCP bridge) goes through
//! the same store.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};

use crate::api::api_error;
use crate::state::AppState;

pub async fn content(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.orch.attachment(&id) {
        Ok(Some(att)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, att.content_type),
                (
                    header::CONTENT_DISPOSITION,
                    format!("inline; filename=\"{}\"", att.name.replace('"', "")),
                ),
            ],
            att.content,
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("attachment '{id}' not found") })),
        )
            .into_response(),
        Err(e) => api_error(&e),
    }
}
