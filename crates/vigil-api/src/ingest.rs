// Agent-facing ingestion endpoints
//
// Agents authenticate with an API key; the hospital and tenant bound to
// the key always override whatever the payload claims, so a
// misconfigured agent cannot write into another tenant.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;

use vigil_core::DeathEvent;

use crate::auth::{authenticate, AuthError};
use crate::health::AgentStatusReport;
use crate::state::AppState;

#[derive(Serialize, ToSchema)]
pub struct IngestAccepted {
    pub status: &'static str,
    /// Bus offset assigned to the event
    pub offset: u64,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/events", post(ingest_event))
        .route("/v1/agents/status", post(agent_status))
        .with_state(state)
}

/// POST /v1/events - ingest a normalized death event
#[utoipa::path(
    post,
    path = "/v1/events",
    request_body = DeathEvent,
    responses(
        (status = 202, description = "Event accepted for triage", body = IngestAccepted),
        (status = 400, description = "Payload failed validation"),
        (status = 401, description = "Invalid or missing API key")
    ),
    security(("api_key" = [])),
    tag = "ingestion"
)]
pub async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut event): Json<DeathEvent>,
) -> Result<(StatusCode, Json<IngestAccepted>), AuthError> {
    let identity = authenticate(state.api_keys.as_ref(), &headers, None).await?;

    // The key decides who this event belongs to
    event.tenant_id = identity.tenant_id;
    event.hospital_id = identity.hospital_id;
    event.hospital_name = Some(identity.hospital_name.clone());

    if let Err(e) = event.validate() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        ));
    }

    let offset = state.bus.publish(&event).await.map_err(|e| {
        tracing::error!(error = %e, "bus publish failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "event bus unavailable"})),
        )
    })?;

    tracing::info!(
        source_id = %event.source_id,
        hospital = %identity.hospital_name,
        offset,
        "event accepted"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestAccepted {
            status: "accepted",
            offset,
        }),
    ))
}

/// POST /v1/agents/status - agent connectivity report
#[utoipa::path(
    post,
    path = "/v1/agents/status",
    request_body = AgentStatusReport,
    responses(
        (status = 204, description = "Report recorded"),
        (status = 401, description = "Invalid or missing API key")
    ),
    security(("api_key" = [])),
    tag = "ingestion"
)]
pub async fn agent_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut report): Json<AgentStatusReport>,
) -> Result<StatusCode, AuthError> {
    let identity = authenticate(state.api_keys.as_ref(), &headers, None).await?;
    report.hospital_id = identity.hospital_id;
    state.agents.record(report);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;
    use uuid::Uuid;

    use vigil_core::{EventBus, IngestIdentity};
    use vigil_storage::{
        MemoryApiKeyStore, MemoryEventBus, MemoryNotificationQueue, MemoryOccurrenceStore,
    };

    use crate::auth::api_key_hash;
    use crate::health::AgentRegistry;
    use crate::hub::RealtimeHub;

    const KEY: &str = "agent-key-1";

    fn state() -> (AppState, Arc<MemoryEventBus>, Uuid) {
        let api_keys = Arc::new(MemoryApiKeyStore::new());
        let tenant_id = Uuid::now_v7();
        api_keys.put(
            api_key_hash(KEY),
            IngestIdentity {
                tenant_id,
                hospital_id: Uuid::now_v7(),
                hospital_name: "Hospital Geral".into(),
            },
        );
        let bus = Arc::new(MemoryEventBus::new());
        let state = AppState {
            occurrences: Arc::new(MemoryOccurrenceStore::new()),
            queue: Arc::new(MemoryNotificationQueue::new()),
            api_keys,
            bus: bus.clone(),
            hub: Arc::new(RealtimeHub::new()),
            agents: Arc::new(AgentRegistry::new()),
        };
        (state, bus, tenant_id)
    }

    fn event_body() -> serde_json::Value {
        serde_json::json!({
            "source_id": "OB-77",
            "tenant_id": Uuid::nil(),
            "hospital_id": Uuid::nil(),
            "death_time": Utc::now(),
            "cause_of_death": "Infarto agudo",
            "age": 67,
            "masked_patient_id": "********901",
            "sector": "UTI",
            "detected_at": Utc::now(),
        })
    }

    fn post_event(key: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/events")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn valid_event_is_accepted_and_rebound_to_the_key() {
        let (state, bus, tenant_id) = state();
        let app = routes(state);

        let response = app.oneshot(post_event(Some(KEY), event_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let records = bus.read_group("triage", "t", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        // Payload claims are overridden by the key's identity
        assert_eq!(records[0].event.tenant_id, tenant_id);
        assert_eq!(
            records[0].event.hospital_name.as_deref(),
            Some("Hospital Geral")
        );
    }

    #[tokio::test]
    async fn missing_or_bad_key_is_unauthorized() {
        let (state, bus, _) = state();
        let app = routes(state);

        let response = app
            .clone()
            .oneshot(post_event(None, event_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(post_event(Some("wrong-key"), event_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(bus.read_group("triage", "t", 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected() {
        let (state, bus, _) = state();
        let app = routes(state);

        // Blank cause fails field validation after deserialization
        let mut body = event_body();
        body["cause_of_death"] = serde_json::json!("");
        let response = app
            .clone()
            .oneshot(post_event(Some(KEY), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Negative age fails too
        let mut body = event_body();
        body["age"] = serde_json::json!(-1);
        let response = app.oneshot(post_event(Some(KEY), body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(bus.read_group("triage", "t", 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn agent_status_report_is_recorded() {
        let (state, _, _) = state();
        let agents = state.agents.clone();
        let app = routes(state);

        let body = serde_json::json!({
            "hospital_id": Uuid::nil(),
            "running": true,
            "connected": false,
            "total_processed": 12,
            "total_errors": 3,
        });
        let request = Request::builder()
            .method("POST")
            .uri("/v1/agents/status")
            .header("content-type", "application/json")
            .header("x-api-key", KEY)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let snapshot = agents.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].status.connected);
        // hospital_id comes from the key, not the payload
        assert_ne!(snapshot[0].status.hospital_id, Uuid::nil());
    }
}
