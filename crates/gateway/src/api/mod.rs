//! HTTP surfaces: REST, WebSocket JSON-RPC, and SSE.

pub mod attachments;
pub mod conversations;
pub mod llm;
pub mod scenarios;
pub mod sse;
pub mod ws;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;

use parley_domain::Error;

use crate::state::AppState;

/// Build the full API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        // Conversations (read side)
        .route("/conversations", get(conversations::list))
        .route("/conversations/:id", get(conversations::get))
        .route("/conversations/:id/events", get(sse::events))
        // Scenarios
        .route("/scenarios", get(scenarios::list))
        .route("/scenarios", post(scenarios::create))
        .route("/scenarios/:id", get(scenarios::get))
        .route("/scenarios/:id", put(scenarios::update))
        .route("/scenarios/:id", delete(scenarios::remove))
        // Attachments
        .route("/attachments/:id/content", get(attachments::content))
        // LLM proxy
        .route("/llm/generate", post(llm::generate))
        // WebSocket JSON-RPC
        .route("/api/ws", get(ws::upgrade))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Build a standardized JSON error response: `{ "error": "...", "kind": "..." }`.
pub(crate) fn api_error(e: &Error) -> Response {
    let status = match e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::ClosedConversation(_)
        | Error::TurnMismatch(_)
        | Error::NoOpenTurn
        | Error::WrongAgent { .. }
        | Error::PreconditionFailed(_) => StatusCode::CONFLICT,
        Error::AgentNotPermitted(_) => StatusCode::FORBIDDEN,
        Error::InvalidEvent(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": e.to_string(), "kind": e.kind() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_maps_status_codes() {
        let cases = [
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::NoOpenTurn, StatusCode::CONFLICT),
            (
                Error::AgentNotPermitted("a".into()),
                StatusCode::FORBIDDEN,
            ),
            (
                Error::PayloadTooLarge { size: 10, max: 1 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(api_error(&err).status(), expected, "{err}");
        }
    }
}
