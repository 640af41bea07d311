use std::sync::Arc;

use vigil_core::{ApiKeyStore, EventBus, NotificationQueue, OccurrenceStore};

use crate::health::AgentRegistry;
use crate::hub::RealtimeHub;

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub occurrences: Arc<dyn OccurrenceStore>,
    pub queue: Arc<dyn NotificationQueue>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub bus: Arc<dyn EventBus>,
    pub hub: Arc<RealtimeHub>,
    pub agents: Arc<AgentRegistry>,
}
