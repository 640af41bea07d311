// Triage motor - the single consumer group turning death events into
// occurrences.
//
// Reads the bus in batches, applies the tenant's triage rules, opens a
// PENDENTE occurrence for eligible events and fans out one queue item
// per (recipient, channel). Every step downstream of the bus read is
// idempotent, so a crash between handling and ack only costs a
// redelivered no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vigil_core::{
    evaluate, window_hours, Channel, DeathEvent, EnqueueRequest, EventBus, NewOccurrence,
    NotificationPayload, NotificationQueue, Occurrence, OccurrenceStore, RealtimeBroadcast,
    RealtimeEvent, RecipientStore, StoreError, TriageRule, TriageRuleStore,
};

/// Triage motor configuration
#[derive(Debug, Clone)]
pub struct MotorConfig {
    /// Consumer group name on the event bus
    pub group: String,
    /// Consumer name within the group
    pub consumer: String,
    /// Records read per bus poll
    pub batch_size: usize,
    /// Idle delay between bus polls
    pub poll_interval: Duration,
    /// How long a tenant's rule set is served from cache
    pub rule_cache_ttl: Duration,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            group: "triage".to_string(),
            consumer: format!("motor-{}", Uuid::now_v7()),
            batch_size: 32,
            poll_interval: Duration::from_millis(500),
            rule_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl MotorConfig {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_rule_cache_ttl(mut self, ttl: Duration) -> Self {
        self.rule_cache_ttl = ttl;
        self
    }
}

/// What the motor did with one event
#[derive(Debug)]
pub enum Handled {
    /// Passed triage; a new occurrence was opened
    Opened(Occurrence),
    /// An occurrence for this (hospital, source ref) already exists
    Duplicate,
    /// Excluded by a triage rule
    Filtered,
}

struct CachedRules {
    rules: Vec<TriageRule>,
    fetched_at: Instant,
}

pub struct TriageMotor {
    bus: Arc<dyn EventBus>,
    occurrences: Arc<dyn OccurrenceStore>,
    rules: Arc<dyn TriageRuleStore>,
    recipients: Arc<dyn RecipientStore>,
    queue: Arc<dyn NotificationQueue>,
    broadcast: Arc<dyn RealtimeBroadcast>,
    config: MotorConfig,
    cache: Mutex<HashMap<Uuid, CachedRules>>,
}

impl TriageMotor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn EventBus>,
        occurrences: Arc<dyn OccurrenceStore>,
        rules: Arc<dyn TriageRuleStore>,
        recipients: Arc<dyn RecipientStore>,
        queue: Arc<dyn NotificationQueue>,
        broadcast: Arc<dyn RealtimeBroadcast>,
        config: MotorConfig,
    ) -> Self {
        Self {
            bus,
            occurrences,
            rules,
            recipients,
            queue,
            broadcast,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Consume the bus until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(group = %self.config.group, "triage motor started");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    // Drain full batches before going back to sleep
                    loop {
                        match self.process_batch().await {
                            Ok(n) if n == self.config.batch_size => continue,
                            Ok(_) => break,
                            Err(e) => {
                                warn!(error = %e, "bus poll failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!("triage motor stopped");
    }

    /// Read and handle one batch. Returns the number of records read.
    pub async fn process_batch(&self) -> anyhow::Result<usize> {
        let records = self
            .bus
            .read_group(&self.config.group, &self.config.consumer, self.config.batch_size)
            .await?;
        let read = records.len();

        for record in records {
            match self.handle_event(&record.event).await {
                Ok(handled) => {
                    debug!(
                        offset = record.offset,
                        source_id = %record.event.source_id,
                        ?handled,
                        "event handled"
                    );
                    self.bus.ack(&self.config.group, record.offset).await?;
                }
                Err(e) => {
                    // Leave unacked; the bus redelivers after the
                    // visibility timeout and creation is idempotent.
                    warn!(
                        offset = record.offset,
                        source_id = %record.event.source_id,
                        error = %e,
                        "event handling failed, will be redelivered"
                    );
                }
            }
        }
        Ok(read)
    }

    /// Triage one event end to end.
    pub async fn handle_event(&self, event: &DeathEvent) -> anyhow::Result<Handled> {
        let now = Utc::now();
        let rules = self.tenant_rules(event.tenant_id).await?;
        let outcome = evaluate(event, &rules, now);

        if !outcome.eligible {
            info!(
                source_id = %event.source_id,
                tenant_id = %event.tenant_id,
                reasons = ?outcome.reasons,
                "event excluded by triage rules"
            );
            return Ok(Handled::Filtered);
        }

        let created = self
            .occurrences
            .create(NewOccurrence {
                tenant_id: event.tenant_id,
                hospital_id: event.hospital_id,
                source_event_ref: event.source_id.clone(),
                priority_score: outcome.score,
                masked_patient_id: event.masked_patient_id.clone(),
                sector: event.sector.clone(),
                death_time: event.death_time,
                event: serde_json::to_value(event)?,
            })
            .await?;

        let Some(occurrence) = created else {
            debug!(
                source_id = %event.source_id,
                hospital_id = %event.hospital_id,
                "duplicate event, occurrence already exists"
            );
            return Ok(Handled::Duplicate);
        };

        info!(
            occurrence_id = %occurrence.id,
            source_id = %event.source_id,
            score = occurrence.priority_score,
            "occurrence opened"
        );

        self.broadcast.broadcast(RealtimeEvent::OccurrenceCreated {
            occurrence: occurrence.clone(),
        });

        self.fan_out(event, &occurrence, window_hours(&rules)).await?;
        Ok(Handled::Opened(occurrence))
    }

    /// One queue item per on-duty recipient per channel they are
    /// reachable on. The (occurrence, user, channel) unique key absorbs
    /// redeliveries.
    async fn fan_out(
        &self,
        event: &DeathEvent,
        occurrence: &Occurrence,
        window_hours: i64,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let payload = NotificationPayload {
            occurrence_id: occurrence.id,
            tenant_id: occurrence.tenant_id,
            hospital_name: event.hospital_name.clone().unwrap_or_default(),
            sector: occurrence.sector.clone(),
            death_time: occurrence.death_time,
            priority_score: occurrence.priority_score,
            time_remaining: format_remaining(event.time_remaining(window_hours, now)),
        };

        for recipient in self.recipients.on_duty(occurrence.tenant_id).await? {
            for channel in Channel::ALL {
                let Some(address) = recipient.address_for(channel) else {
                    continue;
                };
                let enqueued = self
                    .queue
                    .enqueue(EnqueueRequest {
                        occurrence_id: occurrence.id,
                        user_id: recipient.user_id,
                        channel,
                        recipient: address.to_string(),
                        payload: payload.clone(),
                    })
                    .await?;
                if enqueued.is_none() {
                    debug!(
                        occurrence_id = %occurrence.id,
                        user_id = %recipient.user_id,
                        %channel,
                        "notification already enqueued"
                    );
                }
            }
        }
        Ok(())
    }

    async fn tenant_rules(&self, tenant_id: Uuid) -> Result<Vec<TriageRule>, StoreError> {
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(&tenant_id) {
                if cached.fetched_at.elapsed() < self.config.rule_cache_ttl {
                    return Ok(cached.rules.clone());
                }
            }
        }

        let rules = self.rules.active_rules(tenant_id).await?;
        self.cache.lock().insert(
            tenant_id,
            CachedRules {
                rules: rules.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(rules)
    }

    /// Drop cached rules so the next event re-reads them (rule edits).
    pub fn invalidate_rules(&self, tenant_id: Uuid) {
        self.cache.lock().remove(&tenant_id);
    }
}

/// "2h30" style rendering of the remaining capture window
fn format_remaining(remaining: chrono::Duration) -> String {
    let minutes = remaining.num_minutes().max(0);
    format!("{}h{:02}", minutes / 60, minutes % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use vigil_core::{NoopBroadcast, Recipient, RuleKind};
    use vigil_storage::{
        MemoryEventBus, MemoryNotificationQueue, MemoryOccurrenceStore, MemoryRecipientStore,
        MemoryTriageRuleStore,
    };

    struct Fixture {
        bus: Arc<MemoryEventBus>,
        occurrences: Arc<MemoryOccurrenceStore>,
        rules: Arc<MemoryTriageRuleStore>,
        recipients: Arc<MemoryRecipientStore>,
        queue: Arc<MemoryNotificationQueue>,
        motor: TriageMotor,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(MemoryEventBus::new());
        let occurrences = Arc::new(MemoryOccurrenceStore::new());
        let rules = Arc::new(MemoryTriageRuleStore::new());
        let recipients = Arc::new(MemoryRecipientStore::new());
        let queue = Arc::new(MemoryNotificationQueue::new());
        let motor = TriageMotor::new(
            bus.clone(),
            occurrences.clone(),
            rules.clone(),
            recipients.clone(),
            queue.clone(),
            Arc::new(NoopBroadcast),
            MotorConfig::default(),
        );
        Fixture {
            bus,
            occurrences,
            rules,
            recipients,
            queue,
            motor,
        }
    }

    fn event(tenant_id: Uuid, source_id: &str) -> DeathEvent {
        DeathEvent {
            source_id: source_id.into(),
            tenant_id,
            hospital_id: Uuid::now_v7(),
            hospital_name: Some("Hospital Geral".into()),
            death_time: Utc::now() - ChronoDuration::hours(1),
            cause_of_death: "infarto agudo".into(),
            age: 58,
            masked_patient_id: "***442".into(),
            sector: Some("UTI".into()),
            bed: None,
            record_number: None,
            detected_at: Utc::now(),
        }
    }

    fn recipient(email: Option<&str>, phone: Option<&str>) -> Recipient {
        Recipient {
            user_id: Uuid::now_v7(),
            name: "Plantonista".into(),
            email: email.map(Into::into),
            phone: phone.map(Into::into),
            push_token: None,
        }
    }

    #[tokio::test]
    async fn eligible_event_opens_occurrence_and_fans_out() {
        let f = fixture();
        let tenant = Uuid::now_v7();
        f.recipients
            .put(tenant, recipient(Some("a@h.org"), Some("+551199")));
        f.recipients.put(tenant, recipient(Some("b@h.org"), None));

        f.bus.publish(&event(tenant, "OB-1")).await.unwrap();
        assert_eq!(f.motor.process_batch().await.unwrap(), 1);

        let opened = f.occurrences.list_by_tenant(tenant).await.unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].source_event_ref, "OB-1");
        // UTI base 90 + <=2h remaining bump 10
        assert_eq!(opened[0].priority_score, 100);

        // 2 emails + 1 sms; nobody has a push token
        assert_eq!(f.queue.pending_count(Channel::Email), 2);
        assert_eq!(f.queue.pending_count(Channel::Sms), 1);
        assert_eq!(f.queue.pending_count(Channel::Push), 0);

        // Handled events are acked
        assert_eq!(f.bus.lag("triage").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn redelivered_event_does_not_duplicate() {
        let f = fixture();
        let tenant = Uuid::now_v7();
        f.recipients.put(tenant, recipient(Some("a@h.org"), None));

        let ev = event(tenant, "OB-2");
        let first = f.motor.handle_event(&ev).await.unwrap();
        assert!(matches!(first, Handled::Opened(_)));

        let second = f.motor.handle_event(&ev).await.unwrap();
        assert!(matches!(second, Handled::Duplicate));

        assert_eq!(f.occurrences.list_by_tenant(tenant).await.unwrap().len(), 1);
        assert_eq!(f.queue.pending_count(Channel::Email), 1);
    }

    #[tokio::test]
    async fn excluded_cause_is_filtered() {
        let f = fixture();
        let tenant = Uuid::now_v7();
        f.rules.put(TriageRule {
            id: Uuid::now_v7(),
            tenant_id: tenant,
            name: "sem sepse".into(),
            kind: RuleKind::ExcludedCauses,
            params: serde_json::json!({ "causes": ["sepse"] }),
            active: true,
        });

        let mut ev = event(tenant, "OB-3");
        ev.cause_of_death = "Choque septico por Sepse".into();
        let handled = f.motor.handle_event(&ev).await.unwrap();
        assert!(matches!(handled, Handled::Filtered));
        assert!(f.occurrences.list_by_tenant(tenant).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rule_cache_serves_until_invalidated() {
        let f = fixture();
        let tenant = Uuid::now_v7();

        // First event caches the empty rule set
        let first = f.motor.handle_event(&event(tenant, "OB-4")).await.unwrap();
        assert!(matches!(first, Handled::Opened(_)));

        // New rule lands but the cache still serves the old set
        f.rules.put(TriageRule {
            id: Uuid::now_v7(),
            tenant_id: tenant,
            name: "idade maxima".into(),
            kind: RuleKind::MaxAge,
            params: serde_json::json!({ "max_age": 40 }),
            active: true,
        });
        let second = f.motor.handle_event(&event(tenant, "OB-5")).await.unwrap();
        assert!(matches!(second, Handled::Opened(_)));

        f.motor.invalidate_rules(tenant);
        let third = f.motor.handle_event(&event(tenant, "OB-6")).await.unwrap();
        assert!(matches!(third, Handled::Filtered));
    }

    #[test]
    fn remaining_formats_as_hours_minutes() {
        assert_eq!(format_remaining(ChronoDuration::minutes(150)), "2h30");
        assert_eq!(format_remaining(ChronoDuration::minutes(5)), "0h05");
        assert_eq!(format_remaining(ChronoDuration::zero()), "0h00");
    }
}
