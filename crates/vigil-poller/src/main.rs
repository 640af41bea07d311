use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_poller::{connector, AgentConfig, HttpSink, Poller};

/// How often the agent reports its status to the central server
const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "vigil_agent=info,vigil_poller=info,vigil_core=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VIGIL_AGENT_CONFIG").ok())
        .unwrap_or_else(|| "vigil-agent.yaml".to_string());

    let config = AgentConfig::load(&config_path)
        .with_context(|| format!("loading config from {config_path}"))?;
    info!(
        hospital = %config.agent.hospital_name,
        driver = %config.database.driver,
        "vigil agent starting"
    );

    let source = connector::for_config(&config);
    let sink = Arc::new(HttpSink::new(&config.central)?);
    let poller = Arc::new(Poller::new(config, source, sink.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reporter = tokio::spawn({
        let poller = poller.clone();
        let mut shutdown = shutdown_rx.clone();
        async move {
            let mut tick = tokio::time::interval(STATUS_REPORT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        if let Err(e) = sink.report_status(&poller.status()).await {
                            warn!(error = %e, "status report failed");
                        }
                    }
                }
            }
        }
    });

    let runner = tokio::spawn({
        let poller = poller.clone();
        let shutdown = shutdown_rx.clone();
        async move { poller.run(shutdown).await }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    shutdown_tx.send(true).ok();

    runner.await.ok();
    reporter.await.ok();
    info!("vigil agent stopped");
    Ok(())
}
