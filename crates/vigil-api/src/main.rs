// Vigil API server
// Decision: triage runs in-process so the SSE hub sees every occurrence;
// channel dispatch is in-process by default, external via DISPATCH_MODE
// Decision: without DATABASE_URL the server runs fully in-memory for
// local development, seeded with one dev API key

mod auth;
mod health;
mod hub;
mod ingest;
mod occurrences;
mod sse;
mod state;
mod workers;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use vigil_core::{IngestIdentity, Occurrence, OccurrenceStatus, QueueDepth};
use vigil_storage::{
    Database, MemoryApiKeyStore, MemoryEventBus, MemoryNotificationQueue, MemoryOccurrenceStore,
    MemoryRecipientStore, MemoryTriageRuleStore,
};

use crate::health::{AgentSnapshot, AgentStatusReport, HealthResponse, HealthStatusResponse};
use crate::hub::RealtimeHub;
use crate::state::AppState;
use crate::workers::WorkerDeps;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        ingest::ingest_event,
        ingest::agent_status,
        occurrences::list_occurrences,
        occurrences::get_occurrence,
        occurrences::update_status,
        occurrences::get_history,
        sse::stream_occurrences,
        health::health,
        health::health_status,
    ),
    components(schemas(
        vigil_core::DeathEvent,
        Occurrence,
        OccurrenceStatus,
        vigil_core::HistoryEntry,
        vigil_core::HistoryAction,
        QueueDepth,
        ingest::IngestAccepted,
        occurrences::UpdateStatusRequest,
        AgentStatusReport,
        AgentSnapshot,
        HealthResponse,
        HealthStatusResponse,
    )),
    modifiers(&ApiKeySecurity),
    tags(
        (name = "ingestion", description = "Agent-facing event ingestion"),
        (name = "occurrences", description = "Occurrence workflow"),
        (name = "events", description = "Real-time occurrence stream (SSE)"),
        (name = "health", description = "Liveness and component status")
    ),
    info(
        title = "Vigil API",
        description = "Death-event triage and notification service",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

struct ApiKeySecurity;

impl utoipa::Modify for ApiKeySecurity {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "api_key",
            SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-API-Key"))),
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil_api=debug,vigil_worker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    tracing::info!("vigil-api starting");

    let hub = Arc::new(RealtimeHub::new());
    let agents = Arc::new(health::AgentRegistry::new());

    let (app_state, worker_deps) = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let db = Arc::new(
                Database::from_url(&url)
                    .await
                    .context("failed to connect to database")?,
            );
            tracing::info!("connected to database");
            let state = AppState {
                occurrences: db.clone(),
                queue: db.clone(),
                api_keys: db.clone(),
                bus: db.clone(),
                hub: hub.clone(),
                agents: agents.clone(),
            };
            let deps = WorkerDeps {
                bus: db.clone(),
                occurrences: db.clone(),
                rules: db.clone(),
                recipients: db.clone(),
                queue: db.clone(),
                broadcast: hub.clone(),
            };
            (state, deps)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores (dev mode)");
            let occurrences = Arc::new(MemoryOccurrenceStore::new());
            let queue = Arc::new(MemoryNotificationQueue::new());
            let bus = Arc::new(MemoryEventBus::new());
            let api_keys = Arc::new(MemoryApiKeyStore::new());
            seed_dev_api_key(&api_keys);
            let state = AppState {
                occurrences: occurrences.clone(),
                queue: queue.clone(),
                api_keys,
                bus: bus.clone(),
                hub: hub.clone(),
                agents: agents.clone(),
            };
            let deps = WorkerDeps {
                bus,
                occurrences,
                rules: Arc::new(MemoryTriageRuleStore::new()),
                recipients: Arc::new(MemoryRecipientStore::new()),
                queue,
                broadcast: hub.clone(),
            };
            (state, deps)
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_tasks = workers::spawn(worker_deps, shutdown_rx);

    let app = router(app_state);

    let addr = std::env::var("VIGIL_API_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {}", addr);
    tracing::info!("swagger ui available at /swagger-ui");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    shutdown_tx.send(true).ok();
    for task in worker_tasks {
        task.await.ok();
    }
    tracing::info!("vigil-api stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .merge(ingest::routes(state.clone()))
        .merge(occurrences::routes(state.clone()))
        .merge(sse::routes(state.clone()));

    let mut app = Router::new()
        .merge(health::routes(state))
        .merge(api_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()));

    // Only needed when the dashboard is served from a different origin
    let cors_origins: Vec<HeaderValue> = std::env::var("CORS_ALLOWED_ORIGINS")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.split(',').filter_map(|o| o.trim().parse().ok()).collect())
        .unwrap_or_default();
    if !cors_origins.is_empty() {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    axum::http::HeaderName::from_static("x-api-key"),
                ]),
        );
    }

    app.layer(TraceLayer::new_for_http())
}

/// Dev-mode key: VIGIL_DEV_API_KEY (default "dev-key"), bound to a
/// generated tenant unless VIGIL_DEV_TENANT_ID / VIGIL_DEV_HOSPITAL_ID
/// are set.
fn seed_dev_api_key(api_keys: &MemoryApiKeyStore) {
    let key = std::env::var("VIGIL_DEV_API_KEY").unwrap_or_else(|_| "dev-key".to_string());
    let tenant_id = env_uuid("VIGIL_DEV_TENANT_ID").unwrap_or_else(Uuid::now_v7);
    let hospital_id = env_uuid("VIGIL_DEV_HOSPITAL_ID").unwrap_or_else(Uuid::now_v7);
    let hospital_name =
        std::env::var("VIGIL_DEV_HOSPITAL_NAME").unwrap_or_else(|_| "Dev Hospital".to_string());
    tracing::info!(%tenant_id, %hospital_id, "dev api key registered");
    api_keys.put(
        auth::api_key_hash(&key),
        IngestIdentity {
            tenant_id,
            hospital_id,
            hospital_name,
        },
    );
}

fn env_uuid(name: &str) -> Option<Uuid> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
