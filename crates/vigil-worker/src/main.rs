// Standalone worker: triage motor plus one dispatcher per configured
// channel, all against the Postgres backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_core::{Channel, NoopBroadcast};
use vigil_storage::Database;
use vigil_worker::transport::{self, TransportConfig};
use vigil_worker::{ChannelDispatcher, DispatcherConfig, MotorConfig, TriageMotor};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil_worker=debug,vigil_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set for the worker")?;
    let db = Arc::new(Database::from_url(&database_url).await?);
    tracing::info!("connected to database");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let motor = Arc::new(TriageMotor::new(
        db.clone(),
        db.clone(),
        db.clone(),
        db.clone(),
        db.clone(),
        Arc::new(NoopBroadcast),
        MotorConfig::default(),
    ));
    tasks.push(tokio::spawn(motor.run(shutdown_rx.clone())));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    for channel in Channel::ALL {
        let Some(config) = TransportConfig::from_env(channel) else {
            tracing::warn!(%channel, "no provider configured, channel disabled");
            continue;
        };
        let transport = transport::for_channel(channel, client.clone(), config);
        let dispatcher = Arc::new(ChannelDispatcher::new(
            db.clone(),
            db.clone(),
            transport,
            DispatcherConfig::default(),
        ));
        tasks.push(tokio::spawn(dispatcher.run(shutdown_rx.clone())));
    }

    tracing::info!("worker running, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    shutdown_tx.send(true).ok();
    for task in tasks {
        task.await.ok();
    }
    tracing::info!("worker shutdown complete");
    Ok(())
}
