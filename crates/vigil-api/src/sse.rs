// Occurrence event stream (SSE)
//
// Each connected session gets a bounded, tenant-scoped feed from the
// hub. There is no replay: a session that reconnects starts from now
// and should refetch /v1/occurrences to resynchronize.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use utoipa::IntoParams;
use uuid::Uuid;

use vigil_core::RealtimeEvent;

use crate::auth::{authenticate, AuthError};
use crate::hub::RealtimeHub;
use crate::state::AppState;

/// Query parameters for the SSE stream
#[derive(Debug, Deserialize, IntoParams)]
pub struct SseQuery {
    /// API key fallback for EventSource clients, which cannot set headers
    pub api_key: Option<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/occurrences/sse", get(stream_occurrences))
        .with_state(state)
}

/// Hub subscription that deregisters itself when the client goes away.
struct SessionStream {
    hub: Arc<RealtimeHub>,
    id: Uuid,
    receiver: mpsc::Receiver<RealtimeEvent>,
}

impl Stream for SessionStream {
    type Item = Result<SseEvent, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx).map(|maybe| {
            maybe.map(|event| {
                let data = serde_json::to_string(&event).unwrap_or_default();
                Ok(SseEvent::default().event(event.event_name()).data(data))
            })
        })
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

/// GET /v1/occurrences/sse - live occurrence events for the tenant
#[utoipa::path(
    get,
    path = "/v1/occurrences/sse",
    params(SseQuery),
    responses(
        (status = 200, description = "SSE stream of occurrence_created / occurrence_updated events"),
        (status = 401, description = "Invalid or missing API key")
    ),
    security(("api_key" = [])),
    tag = "events"
)]
pub async fn stream_occurrences(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SseQuery>,
) -> Result<Sse<SessionStream>, AuthError> {
    let identity =
        authenticate(state.api_keys.as_ref(), &headers, query.api_key.as_deref()).await?;

    let (id, receiver) = state.hub.subscribe(identity.tenant_id);
    tracing::debug!(tenant_id = %identity.tenant_id, session = %id, "sse stream opened");

    let stream = SessionStream {
        hub: state.hub.clone(),
        id,
        receiver,
    };
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
