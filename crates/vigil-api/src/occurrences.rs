// Occurrence workflow HTTP routes
//
// Tenant scope comes from the API key on every request; an occurrence
// belonging to another tenant is indistinguishable from a missing one.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, patch},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use vigil_core::{
    HistoryEntry, Occurrence, OccurrenceStatus, RealtimeBroadcast, RealtimeEvent, StoreError,
};

use crate::auth::{authenticate, AuthError};
use crate::state::AppState;

/// Request to move an occurrence through its workflow
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UpdateStatusRequest {
    pub status: OccurrenceStatus,
    /// Acting user, recorded in the history
    #[serde(default)]
    pub actor: Option<Uuid>,
    /// Free-text outcome, accepted only at a terminal status
    #[serde(default)]
    pub outcome: Option<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/occurrences", get(list_occurrences))
        .route("/v1/occurrences/:id", get(get_occurrence))
        .route("/v1/occurrences/:id/status", patch(update_status))
        .route("/v1/occurrences/:id/history", get(get_history))
        .with_state(state)
}

fn store_error(e: StoreError) -> AuthError {
    match e {
        StoreError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "occurrence not found"})),
        ),
        StoreError::InvalidTransition { from, to } => (
            StatusCode::CONFLICT,
            Json(json!({"error": format!("cannot move occurrence from {from} to {to}")})),
        ),
        other => {
            tracing::error!(error = %other, "occurrence store failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
        }
    }
}

/// Fetch scoped to the caller's tenant; cross-tenant reads 404.
async fn fetch_scoped(
    state: &AppState,
    tenant_id: Uuid,
    id: Uuid,
) -> Result<Occurrence, AuthError> {
    let occurrence = state
        .occurrences
        .get(id)
        .await
        .map_err(store_error)?
        .filter(|o| o.tenant_id == tenant_id)
        .ok_or_else(|| store_error(StoreError::NotFound(id)))?;
    Ok(occurrence)
}

/// GET /v1/occurrences - open and recent occurrences for the tenant
#[utoipa::path(
    get,
    path = "/v1/occurrences",
    responses(
        (status = 200, description = "Occurrences, newest first", body = [Occurrence]),
        (status = 401, description = "Invalid or missing API key")
    ),
    security(("api_key" = [])),
    tag = "occurrences"
)]
pub async fn list_occurrences(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Occurrence>>, AuthError> {
    let identity = authenticate(state.api_keys.as_ref(), &headers, None).await?;
    let occurrences = state
        .occurrences
        .list_by_tenant(identity.tenant_id)
        .await
        .map_err(store_error)?;
    Ok(Json(occurrences))
}

/// GET /v1/occurrences/{id}
#[utoipa::path(
    get,
    path = "/v1/occurrences/{id}",
    params(("id" = Uuid, Path, description = "Occurrence ID")),
    responses(
        (status = 200, description = "Occurrence detail", body = Occurrence),
        (status = 404, description = "Unknown occurrence")
    ),
    security(("api_key" = [])),
    tag = "occurrences"
)]
pub async fn get_occurrence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Occurrence>, AuthError> {
    let identity = authenticate(state.api_keys.as_ref(), &headers, None).await?;
    let occurrence = fetch_scoped(&state, identity.tenant_id, id).await?;
    Ok(Json(occurrence))
}

/// PATCH /v1/occurrences/{id}/status - validated workflow transition
#[utoipa::path(
    patch,
    path = "/v1/occurrences/{id}/status",
    params(("id" = Uuid, Path, description = "Occurrence ID")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Updated occurrence", body = Occurrence),
        (status = 404, description = "Unknown occurrence"),
        (status = 409, description = "Transition not allowed")
    ),
    security(("api_key" = [])),
    tag = "occurrences"
)]
pub async fn update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<Occurrence>, AuthError> {
    let identity = authenticate(state.api_keys.as_ref(), &headers, None).await?;
    fetch_scoped(&state, identity.tenant_id, id).await?;

    if request.outcome.is_some() && !request.status.is_terminal() {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({"error": "outcome is only accepted at a terminal status"})),
        ));
    }

    let mut occurrence = state
        .occurrences
        .update_status(id, request.status, request.actor)
        .await
        .map_err(store_error)?;

    if let Some(outcome) = request.outcome.as_deref() {
        state
            .occurrences
            .set_outcome(id, outcome)
            .await
            .map_err(store_error)?;
        occurrence.outcome = Some(outcome.to_string());
    }

    state.hub.broadcast(RealtimeEvent::OccurrenceUpdated {
        occurrence: occurrence.clone(),
    });
    Ok(Json(occurrence))
}

/// GET /v1/occurrences/{id}/history - audit trail
#[utoipa::path(
    get,
    path = "/v1/occurrences/{id}/history",
    params(("id" = Uuid, Path, description = "Occurrence ID")),
    responses(
        (status = 200, description = "History entries, oldest first", body = [HistoryEntry]),
        (status = 404, description = "Unknown occurrence")
    ),
    security(("api_key" = [])),
    tag = "occurrences"
)]
pub async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<HistoryEntry>>, AuthError> {
    let identity = authenticate(state.api_keys.as_ref(), &headers, None).await?;
    fetch_scoped(&state, identity.tenant_id, id).await?;
    let history = state.occurrences.history(id).await.map_err(store_error)?;
    Ok(Json(history))
}
