// In-process background workers
//
// The triage motor always runs inside the API server so that created
// occurrences reach connected SSE sessions through the hub. Channel
// dispatchers run in-process by default; set DISPATCH_MODE=external
// when a standalone vigil-worker handles delivery instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vigil_core::{
    Channel, EventBus, NotificationQueue, OccurrenceStore, RealtimeBroadcast, RecipientStore,
    TriageRuleStore,
};
use vigil_worker::transport::{self, TransportConfig};
use vigil_worker::{ChannelDispatcher, DispatcherConfig, MotorConfig, TriageMotor};

/// Consumer group the motor reads under; health reports lag for it
pub const TRIAGE_GROUP: &str = "triage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    InProcess,
    External,
}

impl DispatchMode {
    pub fn from_env() -> Self {
        match std::env::var("DISPATCH_MODE").as_deref() {
            Ok("external") => DispatchMode::External,
            _ => DispatchMode::InProcess,
        }
    }
}

pub struct WorkerDeps {
    pub bus: Arc<dyn EventBus>,
    pub occurrences: Arc<dyn OccurrenceStore>,
    pub rules: Arc<dyn TriageRuleStore>,
    pub recipients: Arc<dyn RecipientStore>,
    pub queue: Arc<dyn NotificationQueue>,
    pub broadcast: Arc<dyn RealtimeBroadcast>,
}

pub fn spawn(deps: WorkerDeps, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    let motor = Arc::new(TriageMotor::new(
        deps.bus,
        deps.occurrences.clone(),
        deps.rules,
        deps.recipients,
        deps.queue.clone(),
        deps.broadcast,
        MotorConfig::default().with_group(TRIAGE_GROUP),
    ));
    tasks.push(tokio::spawn(motor.run(shutdown.clone())));

    match DispatchMode::from_env() {
        DispatchMode::External => {
            info!("dispatch mode: external worker handles delivery");
        }
        DispatchMode::InProcess => {
            let client = match reqwest_client() {
                Ok(client) => client,
                Err(e) => {
                    warn!(error = %e, "http client init failed, dispatchers disabled");
                    return tasks;
                }
            };
            for channel in Channel::ALL {
                let Some(config) = TransportConfig::from_env(channel) else {
                    warn!(%channel, "no provider configured, channel disabled");
                    continue;
                };
                let dispatcher = Arc::new(ChannelDispatcher::new(
                    deps.queue.clone(),
                    deps.occurrences.clone(),
                    transport::for_channel(channel, client.clone(), config),
                    DispatcherConfig::default(),
                ));
                tasks.push(tokio::spawn(dispatcher.run(shutdown.clone())));
            }
        }
    }

    tasks
}

fn reqwest_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
}
