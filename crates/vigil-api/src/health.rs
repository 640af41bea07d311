// Health endpoints
//
// /health is a bare liveness probe. /health/status aggregates the
// picture an operator needs: agent connectivity (as last reported by
// each agent on its status push), per-channel queue depth, dead-letter
// counts, and how far the triage group is behind the bus.

use std::collections::HashMap;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use vigil_core::{Channel, QueueDepth};

use crate::state::AppState;
use crate::workers::TRIAGE_GROUP;

/// Status payload agents push to /v1/agents/status
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentStatusReport {
    pub hospital_id: Uuid,
    pub running: bool,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_processed: u64,
    #[serde(default)]
    pub total_errors: u64,
}

/// Last report per hospital, newest wins
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AgentSnapshot {
    #[serde(flatten)]
    pub status: AgentStatusReport,
    pub received_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct AgentRegistry {
    reports: RwLock<HashMap<Uuid, AgentSnapshot>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, status: AgentStatusReport) {
        self.reports.write().insert(
            status.hospital_id,
            AgentSnapshot {
                status,
                received_at: Utc::now(),
            },
        );
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        let mut agents: Vec<_> = self.reports.read().values().cloned().collect();
        agents.sort_by_key(|a| a.status.hospital_id);
        agents
    }
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize, ToSchema)]
pub struct HealthStatusResponse {
    pub status: &'static str,
    pub agents: Vec<AgentSnapshot>,
    pub queues: Vec<QueueDepth>,
    pub triage_lag: u64,
    pub sse_sessions: usize,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/status", get(health_status))
        .with_state(state)
}

/// GET /health - liveness
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "health"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /health/status - aggregated component status
#[utoipa::path(
    get,
    path = "/health/status",
    responses((status = 200, description = "Component status snapshot", body = HealthStatusResponse)),
    tag = "health"
)]
pub async fn health_status(
    State(state): State<AppState>,
) -> Result<Json<HealthStatusResponse>, StatusCode> {
    let mut queues = Vec::with_capacity(Channel::ALL.len());
    for channel in Channel::ALL {
        let depth = state
            .queue
            .depth(channel)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        queues.push(depth);
    }

    let triage_lag = state
        .bus
        .lag(TRIAGE_GROUP)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let agents = state.agents.snapshot();
    let degraded = agents.iter().any(|a| !a.status.connected)
        || queues.iter().any(|q| q.dead_letter > 0);

    Ok(Json(HealthStatusResponse {
        status: if degraded { "degraded" } else { "ok" },
        agents,
        queues,
        triage_lag,
        sse_sessions: state.hub.session_count(),
    }))
}
