//! Server-sent events — `GET /conversations/:id/events?sinceSeq=`.
//!
//! Streams the backlog after `sinceSeq` followed by live events as
//! `data: <json>` frames. Client disconnect drops the stream, which drops
//! the hub subscription.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::Stream;
use serde::Deserialize;

use crate::api::api_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    #[serde(default)]
    pub since_seq: u64,
    #[serde(default)]
    pub include_guidance: bool,
}

pub async fn events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let (backlog, sub) =
        match state
            .orch
            .subscribe_with_backfill(id, query.since_seq, query.include_guidance)
        {
            Ok(pair) => pair,
            Err(e) => return api_error(&e),
        };

    Sse::new(event_stream(backlog, sub))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn event_stream(
    backlog: Vec<parley_domain::Event>,
    mut sub: parley_orchestrator::Subscription,
) -> impl Stream<Item = Result<SseEvent, std::convert::Infallible>> {
    async_stream::stream! {
        for event in backlog {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(SseEvent::default().data(data));
        }
        while let Some(event) = sub.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(SseEvent::default().data(data));
        }
        // sub dropped here — the hub slot is released.
    }
}
