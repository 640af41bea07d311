// The poll loop
//
// Idle -> Connecting -> Fetching -> Dispatching -> Idle, with Backoff
// when the source is down. Records are dispatched strictly in source
// order and the watermark never moves past a record that failed with a
// retryable error; such records are fetched again next cycle and the
// server-side idempotency absorbs any double push.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use vigil_core::{mask_name, AlertLimiter, BackoffSchedule, EventSink};

use crate::config::AgentConfig;
use crate::connector::{ConnectorError, SourceConnector};
use crate::normalize::{normalize, AgentIdentity};
use crate::state::{AgentState, StateFile};

/// How often a dirty watermark is flushed to disk
const STATE_SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Health snapshot, also what the agent reports to the central server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerStatus {
    pub hospital_id: uuid::Uuid,
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
    pub total_processed: u64,
    pub total_errors: u64,
}

struct Inner {
    state: AgentState,
    dirty: bool,
    connected: bool,
    offline_since: Option<(Instant, DateTime<Utc>)>,
    last_poll: Option<DateTime<Utc>>,
    total_errors: u64,
    alert: AlertLimiter,
}

pub struct Poller {
    config: AgentConfig,
    identity: AgentIdentity,
    connector: Box<dyn SourceConnector>,
    sink: Arc<dyn EventSink>,
    state_file: StateFile,
    backoff: BackoffSchedule,
    inner: Mutex<Inner>,
}

impl Poller {
    pub fn new(
        config: AgentConfig,
        connector: Box<dyn SourceConnector>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let identity = AgentIdentity {
            tenant_id: config.agent.tenant_id,
            hospital_id: config.agent.hospital_id,
            hospital_name: config.agent.hospital_name.clone(),
        };
        let state_file = StateFile::new(&config.agent.state_file);
        let alert = AlertLimiter::new(config.alert_cooldown());
        Self {
            config,
            identity,
            connector,
            sink,
            state_file,
            backoff: BackoffSchedule::reconnect(),
            inner: Mutex::new(Inner {
                state: AgentState::default(),
                dirty: false,
                connected: false,
                offline_since: None,
                last_poll: None,
                total_errors: 0,
                alert,
            }),
        }
    }

    /// Poll until shutdown is signalled; flushes the watermark on exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        match self.state_file.load() {
            Ok(state) => {
                if let Some(at) = state.last_processed_at {
                    info!(watermark = %at, "resuming from persisted state");
                }
                self.inner.lock().state = state;
            }
            Err(e) => warn!(error = %e, "could not load state, starting fresh"),
        }

        info!(
            hospital = %self.config.agent.hospital_name,
            interval_secs = self.config.agent.poll_interval_secs,
            "poller started"
        );

        let mut poll_tick = tokio::time::interval(self.config.poll_interval());
        let mut save_tick = tokio::time::interval(STATE_SAVE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = poll_tick.tick() => {
                    self.poll_once(&mut shutdown).await;
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = save_tick.tick() => {
                    self.flush_state();
                }
            }
        }

        self.flush_state();
        self.connector.close().await;
        info!("poller stopped");
    }

    /// One full poll cycle. Public so operators (and tests) can force a
    /// cycle outside the tick cadence.
    pub async fn poll_once(&self, shutdown: &mut watch::Receiver<bool>) {
        self.inner.lock().last_poll = Some(Utc::now());

        if !self.connector.is_connected().await && !self.reconnect(shutdown).await {
            return;
        }

        let watermark = self.watermark();
        debug!(%watermark, "fetching records");
        let records = match self.connector.fetch_new_records(watermark).await {
            Ok(records) => records,
            Err(ConnectorError::Connection(e)) => {
                warn!(error = %e, "lost source connection");
                self.mark_offline();
                self.connector.close().await;
                return;
            }
            Err(ConnectorError::Query(e)) => {
                warn!(error = %e, "source query failed");
                let mut inner = self.inner.lock();
                inner.total_errors += 1;
                inner.state.record_error(&e);
                inner.dirty = true;
                return;
            }
        };

        if records.is_empty() {
            return;
        }
        info!(count = records.len(), "detected new records");

        for record in records {
            if *shutdown.borrow() {
                return;
            }
            let event = match normalize(&record, &self.identity, Utc::now()) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        source_id = %record.source_id,
                        patient = %mask_name(&record.patient_name),
                        error = %e,
                        "record failed normalization, skipping"
                    );
                    let mut inner = self.inner.lock();
                    inner.total_errors += 1;
                    inner.state.skip(&record.source_id, record.death_time);
                    inner.dirty = true;
                    continue;
                }
            };

            match self.sink.publish_event(&event).await {
                Ok(()) => {
                    debug!(source_id = %event.source_id, "event dispatched");
                    let mut inner = self.inner.lock();
                    inner.state.advance(&record.source_id, record.death_time);
                    inner.dirty = true;
                }
                Err(e) if e.is_retryable() => {
                    // Stop here; this and later records retry next cycle
                    warn!(
                        source_id = %event.source_id,
                        error = %e,
                        "push failed, will retry next cycle"
                    );
                    let mut inner = self.inner.lock();
                    inner.total_errors += 1;
                    inner.state.record_error(&e.to_string());
                    inner.dirty = true;
                    return;
                }
                Err(e) => {
                    error!(
                        source_id = %event.source_id,
                        error = %e,
                        "event rejected by central, skipping"
                    );
                    let mut inner = self.inner.lock();
                    inner.total_errors += 1;
                    inner.state.record_error(&e.to_string());
                    inner.state.skip(&record.source_id, record.death_time);
                    inner.dirty = true;
                }
            }
        }
    }

    /// Walk the backoff schedule once; gives up for this cycle after the
    /// last interval so the loop stays responsive to shutdown.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        for attempt in 0..self.backoff.len() {
            info!(attempt = attempt + 1, "connecting to source database");
            match self.connector.connect().await {
                Ok(()) => {
                    let mut inner = self.inner.lock();
                    if inner.offline_since.is_some() {
                        info!("source connection restored");
                    }
                    inner.connected = true;
                    inner.offline_since = None;
                    return true;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "connect failed");
                    self.mark_offline();
                }
            }

            let delay = self.backoff.delay(attempt);
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return false;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        false
    }

    fn mark_offline(&self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.total_errors += 1;
        let (since, _) = *inner
            .offline_since
            .get_or_insert((Instant::now(), Utc::now()));

        let offline_for = since.elapsed();
        if offline_for >= self.config.alert_threshold() && inner.alert.should_fire() {
            error!(
                offline_secs = offline_for.as_secs(),
                threshold_secs = self.config.alert_threshold().as_secs(),
                "source database offline beyond threshold"
            );
        }
    }

    fn watermark(&self) -> DateTime<Utc> {
        let inner = self.inner.lock();
        inner.state.last_processed_at.unwrap_or_else(|| {
            Utc::now() - chrono::Duration::hours(self.config.agent.lookback_hours)
        })
    }

    fn flush_state(&self) {
        let snapshot = {
            let mut inner = self.inner.lock();
            if !inner.dirty {
                return;
            }
            inner.dirty = false;
            inner.state.clone()
        };
        if let Err(e) = self.state_file.save(&snapshot) {
            warn!(error = %e, "failed to persist state");
            self.inner.lock().dirty = true;
        }
    }

    pub fn status(&self) -> PollerStatus {
        let inner = self.inner.lock();
        PollerStatus {
            hospital_id: self.identity.hospital_id,
            running: true,
            connected: inner.connected,
            offline_since: inner.offline_since.map(|(_, at)| at),
            last_poll: inner.last_poll,
            last_processed_id: inner.state.last_processed_id.clone(),
            watermark: inner.state.last_processed_at,
            total_processed: inner.state.total_processed,
            total_errors: inner.total_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use vigil_core::{DeathEvent, SinkError};

    use crate::config::{
        AgentSettings, CentralConfig, DatabaseConfig, FieldMapping, MappingConfig,
    };
    use crate::connector::SourceRecord;

    struct ScriptedConnector {
        records: Mutex<Vec<SourceRecord>>,
        fail_connect: AtomicBool,
        connected: AtomicBool,
    }

    impl ScriptedConnector {
        fn with_records(records: Vec<SourceRecord>) -> Self {
            Self {
                records: Mutex::new(records),
                fail_connect: AtomicBool::new(false),
                connected: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl SourceConnector for ScriptedConnector {
        async fn connect(&self) -> Result<(), ConnectorError> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(ConnectorError::Connection("refused".into()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_new_records(
            &self,
            watermark: DateTime<Utc>,
        ) -> Result<Vec<SourceRecord>, ConnectorError> {
            let mut out: Vec<SourceRecord> = self
                .records
                .lock()
                .iter()
                .filter(|r| r.death_time > watermark)
                .cloned()
                .collect();
            out.sort_by_key(|r| r.death_time);
            Ok(out)
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ScriptedSink {
        outcomes: Mutex<VecDeque<Result<(), SinkError>>>,
        published: Mutex<Vec<DeathEvent>>,
    }

    impl ScriptedSink {
        fn script(&self, outcome: Result<(), SinkError>) {
            self.outcomes.lock().push_back(outcome);
        }
    }

    #[async_trait]
    impl EventSink for ScriptedSink {
        async fn publish_event(&self, event: &DeathEvent) -> Result<(), SinkError> {
            match self.outcomes.lock().pop_front().unwrap_or(Ok(())) {
                Ok(()) => {
                    self.published.lock().push(event.clone());
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    }

    fn config(tag: &str) -> AgentConfig {
        AgentConfig {
            database: DatabaseConfig {
                driver: "postgres".into(),
                host: "localhost".into(),
                port: 5432,
                database: "records".into(),
                user: "ro".into(),
                password: String::new(),
                ssl_mode: None,
            },
            mapping: MappingConfig {
                source_table: "tb_death".into(),
                filter_column: "dt_death".into(),
                custom_query: None,
                fields: FieldMapping {
                    source_id: "cd".into(),
                    patient_name: "nm".into(),
                    death_time: "dt_death".into(),
                    cause_of_death: "ds".into(),
                    age: "age".into(),
                    document_id: "doc".into(),
                    ..Default::default()
                },
            },
            central: CentralConfig {
                url: "http://localhost:9".into(),
                api_key: "k".into(),
                timeout_secs: 1,
            },
            agent: AgentSettings {
                tenant_id: Uuid::now_v7(),
                hospital_id: Uuid::now_v7(),
                hospital_name: "HGF".into(),
                poll_interval_secs: 3,
                state_file: std::env::temp_dir()
                    .join(format!("vigil-poller-test-{tag}-{}.json", Uuid::now_v7()))
                    .display()
                    .to_string(),
                alert_threshold_secs: 0,
                alert_cooldown_secs: 1800,
                lookback_hours: 24,
            },
        }
    }

    fn record(id: &str, minutes_ago: i64) -> SourceRecord {
        SourceRecord {
            source_id: id.into(),
            patient_name: "Maria da Silva".into(),
            death_time: Utc::now() - chrono::Duration::minutes(minutes_ago),
            cause_of_death: "infarto".into(),
            birth_date: None,
            age: Some(70),
            national_health_id: None,
            document_id: Some("12345678901".into()),
            sector: Some("UTI".into()),
            bed: None,
            record_number: None,
        }
    }

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn dispatches_in_order_and_advances_watermark() {
        let connector = Box::new(ScriptedConnector::with_records(vec![
            record("OB-2", 30),
            record("OB-1", 60),
        ]));
        let sink = Arc::new(ScriptedSink::default());
        let poller = Poller::new(config("order"), connector, sink.clone());

        let (_tx, mut rx) = shutdown_pair();
        poller.poll_once(&mut rx).await;

        let published = sink.published.lock();
        assert_eq!(published.len(), 2);
        // Source order, oldest first
        assert_eq!(published[0].source_id, "OB-1");
        assert_eq!(published[1].source_id, "OB-2");

        let status = poller.status();
        assert_eq!(status.total_processed, 2);
        assert_eq!(status.last_processed_id.as_deref(), Some("OB-2"));
        assert!(status.connected);
    }

    #[tokio::test]
    async fn retryable_push_failure_blocks_the_watermark() {
        let connector = Box::new(ScriptedConnector::with_records(vec![
            record("OB-1", 60),
            record("OB-2", 30),
        ]));
        let sink = Arc::new(ScriptedSink::default());
        sink.script(Ok(()));
        sink.script(Err(SinkError::Unavailable("central down".into())));
        let poller = Poller::new(config("block"), connector, sink.clone());

        let (_tx, mut rx) = shutdown_pair();
        poller.poll_once(&mut rx).await;
        assert_eq!(poller.status().last_processed_id.as_deref(), Some("OB-1"));
        assert_eq!(poller.status().total_errors, 1);

        // Next cycle re-fetches only the blocked record and succeeds
        poller.poll_once(&mut rx).await;
        assert_eq!(sink.published.lock().len(), 2);
        assert_eq!(poller.status().last_processed_id.as_deref(), Some("OB-2"));
    }

    #[tokio::test]
    async fn rejected_push_skips_the_record() {
        let connector = Box::new(ScriptedConnector::with_records(vec![record("OB-1", 60)]));
        let sink = Arc::new(ScriptedSink::default());
        sink.script(Err(SinkError::Rejected("bad payload".into())));
        let poller = Poller::new(config("reject"), connector, sink.clone());

        let (_tx, mut rx) = shutdown_pair();
        poller.poll_once(&mut rx).await;

        let status = poller.status();
        assert!(sink.published.lock().is_empty());
        assert_eq!(status.total_errors, 1);
        // Watermark moved past the poison record
        assert_eq!(status.last_processed_id.as_deref(), Some("OB-1"));
        assert_eq!(status.total_processed, 0);

        // No republish on the next cycle
        poller.poll_once(&mut rx).await;
        assert!(sink.published.lock().is_empty());
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_state() {
        let cfg = config("resume");
        let records = vec![record("OB-1", 60), record("OB-2", 30)];

        {
            let connector = Box::new(ScriptedConnector::with_records(records.clone()));
            let sink = Arc::new(ScriptedSink::default());
            let poller = Poller::new(cfg.clone(), connector, sink.clone());
            let (_tx, mut rx) = shutdown_pair();
            poller.poll_once(&mut rx).await;
            poller.flush_state();
            assert_eq!(sink.published.lock().len(), 2);
        }

        // Fresh poller, same state file: nothing is reprocessed
        let connector = Box::new(ScriptedConnector::with_records(records));
        let sink = Arc::new(ScriptedSink::default());
        let poller = Poller::new(cfg.clone(), connector, sink.clone());
        let loaded = StateFile::new(&cfg.agent.state_file).load().unwrap();
        poller.inner.lock().state = loaded;

        let (_tx, mut rx) = shutdown_pair();
        poller.poll_once(&mut rx).await;
        assert!(sink.published.lock().is_empty());

        std::fs::remove_file(&cfg.agent.state_file).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn offline_alert_fires_once_per_cooldown() {
        let connector = Box::new(ScriptedConnector::with_records(vec![]));
        connector.fail_connect.store(true, Ordering::SeqCst);
        let sink = Arc::new(ScriptedSink::default());
        let poller = Poller::new(config("offline"), connector, sink);

        let (_tx, mut rx) = shutdown_pair();
        // Walks the whole reconnect schedule without connecting
        poller.poll_once(&mut rx).await;

        let status = poller.status();
        assert!(!status.connected);
        assert!(status.offline_since.is_some());
        assert!(status.total_errors >= 5);

        // The limiter has fired once and is now inside its cooldown
        assert!(!poller.inner.lock().alert.should_fire());
    }
}
