// Per-channel notification dispatchers
//
// One dispatcher per channel drains its queue: claim due items, hand
// them to the transport, then mark sent, reschedule with exponential
// backoff, or dead-letter after the fifth failed attempt. The first
// successful delivery for an occurrence stamps notified_at; later
// channels lose that race silently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vigil_core::{NotificationQueue, OccurrenceStore, RetryPolicy, StoreError};

use crate::transport::{DeliveryError, Transport};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Items claimed per drain pass
    pub batch_size: usize,
    /// Idle delay between drain passes
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::notification(),
        }
    }
}

/// Counters from one drain pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub sent: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

pub struct ChannelDispatcher {
    queue: Arc<dyn NotificationQueue>,
    occurrences: Arc<dyn OccurrenceStore>,
    transport: Arc<dyn Transport>,
    config: DispatcherConfig,
}

impl ChannelDispatcher {
    pub fn new(
        queue: Arc<dyn NotificationQueue>,
        occurrences: Arc<dyn OccurrenceStore>,
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            occurrences,
            transport,
            config,
        }
    }

    /// Drain the channel queue until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let channel = self.transport.channel();
        info!(%channel, "dispatcher started");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.drain_due(Utc::now()).await {
                        warn!(%channel, error = %e, "drain pass failed");
                    }
                }
            }
        }
        info!(%channel, "dispatcher stopped");
    }

    /// One drain pass over items due at `now`.
    pub async fn drain_due(&self, now: DateTime<Utc>) -> Result<DrainStats, StoreError> {
        let channel = self.transport.channel();
        let items = self
            .queue
            .claim_due(channel, now, self.config.batch_size)
            .await?;

        let mut stats = DrainStats::default();
        for item in items {
            match self.transport.deliver(&item).await {
                Ok(()) => {
                    self.queue.mark_sent(item.id, now).await?;
                    stats.sent += 1;
                    if self
                        .occurrences
                        .stamp_notified_at(item.occurrence_id, now)
                        .await?
                    {
                        info!(
                            occurrence_id = %item.occurrence_id,
                            %channel,
                            "first notification delivered"
                        );
                    }
                    debug!(item_id = %item.id, %channel, to = %item.recipient, "delivered");
                }
                Err(e) => {
                    // item.retries counts previous failures; this attempt
                    // is number retries + 1, and the fifth one is final.
                    // Both error classes walk the same schedule.
                    if self.config.retry.allows_retry(item.retries + 1) {
                        let delay = self.config.retry.delay_for_attempt(item.retries + 1);
                        let next = now
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(16));
                        self.queue.reschedule(item.id, &e.to_string(), next).await?;
                        stats.rescheduled += 1;
                        debug!(
                            item_id = %item.id,
                            %channel,
                            retries = item.retries + 1,
                            delay_secs = delay.as_secs(),
                            error = %e,
                            "delivery failed, rescheduled"
                        );
                    } else {
                        self.queue.mark_dead_letter(item.id, &e.to_string()).await?;
                        stats.dead_lettered += 1;
                        let permanent = matches!(e, DeliveryError::Permanent(_));
                        warn!(
                            item_id = %item.id,
                            occurrence_id = %item.occurrence_id,
                            %channel,
                            permanent,
                            error = %e,
                            "delivery dead-lettered"
                        );
                    }
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;
    use vigil_core::{
        Channel, DeliveryStatus, EnqueueRequest, NewOccurrence, NotificationPayload,
    };
    use vigil_storage::{MemoryNotificationQueue, MemoryOccurrenceStore};

    use crate::transport::fake::FakeTransport;

    struct Fixture {
        queue: Arc<MemoryNotificationQueue>,
        occurrences: Arc<MemoryOccurrenceStore>,
        transport: Arc<FakeTransport>,
        dispatcher: ChannelDispatcher,
    }

    fn fixture(channel: Channel) -> Fixture {
        // Zero-length lease so sequential drain passes in one test can
        // reclaim the same item immediately.
        let queue =
            Arc::new(MemoryNotificationQueue::new().with_visibility(Duration::from_secs(0)));
        let occurrences = Arc::new(MemoryOccurrenceStore::new());
        let transport = Arc::new(FakeTransport::new(channel));
        let dispatcher = ChannelDispatcher::new(
            queue.clone(),
            occurrences.clone(),
            transport.clone(),
            DispatcherConfig::default(),
        );
        Fixture {
            queue,
            occurrences,
            transport,
            dispatcher,
        }
    }

    async fn seed(f: &Fixture, channel: Channel) -> (Uuid, Uuid) {
        let occurrence = f
            .occurrences
            .create(NewOccurrence {
                tenant_id: Uuid::now_v7(),
                hospital_id: Uuid::now_v7(),
                source_event_ref: Uuid::now_v7().to_string(),
                priority_score: 90,
                masked_patient_id: "***1".into(),
                sector: Some("UTI".into()),
                death_time: Utc::now(),
                event: serde_json::json!({}),
            })
            .await
            .unwrap()
            .unwrap();

        let item_id = f
            .queue
            .enqueue(EnqueueRequest {
                occurrence_id: occurrence.id,
                user_id: Uuid::now_v7(),
                channel,
                recipient: "ana@h.org".into(),
                payload: NotificationPayload {
                    occurrence_id: occurrence.id,
                    tenant_id: occurrence.tenant_id,
                    hospital_name: "HGF".into(),
                    sector: None,
                    death_time: Utc::now(),
                    priority_score: 90,
                    time_remaining: "3h00".into(),
                },
            })
            .await
            .unwrap()
            .unwrap();
        (occurrence.id, item_id)
    }

    #[tokio::test]
    async fn success_marks_sent_and_stamps_notified_at() {
        let f = fixture(Channel::Email);
        let (occurrence_id, _) = seed(&f, Channel::Email).await;

        let stats = f.dispatcher.drain_due(Utc::now()).await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(f.transport.delivered.lock().len(), 1);

        let occurrence = f.occurrences.get(occurrence_id).await.unwrap().unwrap();
        assert!(occurrence.notified_at.is_some());

        let depth = f.queue.depth(Channel::Email).await.unwrap();
        assert_eq!(depth.pending, 0);
    }

    #[tokio::test]
    async fn first_channel_wins_the_notified_at_stamp() {
        let f = fixture(Channel::Email);
        let (occurrence_id, _) = seed(&f, Channel::Email).await;

        f.dispatcher.drain_due(Utc::now()).await.unwrap();
        let stamped = f.occurrences.get(occurrence_id).await.unwrap().unwrap();
        let first_stamp = stamped.notified_at.unwrap();

        // A second delivery for the same occurrence must not move it
        let sms = fixture(Channel::Sms);
        let sms_dispatcher = ChannelDispatcher::new(
            f.queue.clone(),
            f.occurrences.clone(),
            sms.transport.clone(),
            DispatcherConfig::default(),
        );
        f.queue
            .enqueue(EnqueueRequest {
                occurrence_id,
                user_id: Uuid::now_v7(),
                channel: Channel::Sms,
                recipient: "+5511".into(),
                payload: NotificationPayload {
                    occurrence_id,
                    tenant_id: Uuid::now_v7(),
                    hospital_name: "HGF".into(),
                    sector: None,
                    death_time: Utc::now(),
                    priority_score: 90,
                    time_remaining: "3h00".into(),
                },
            })
            .await
            .unwrap();
        sms_dispatcher
            .drain_due(Utc::now() + ChronoDuration::seconds(30))
            .await
            .unwrap();

        let after = f.occurrences.get(occurrence_id).await.unwrap().unwrap();
        assert_eq!(after.notified_at.unwrap(), first_stamp);
    }

    #[tokio::test]
    async fn failures_walk_the_backoff_schedule() {
        let f = fixture(Channel::Email);
        let (_, item_id) = seed(&f, Channel::Email).await;
        f.transport.script_failures(1);

        let now = Utc::now();
        let stats = f.dispatcher.drain_due(now).await.unwrap();
        assert_eq!(stats.rescheduled, 1);

        // First retry lands 1s out
        let due_early = f.dispatcher.drain_due(now).await.unwrap();
        assert_eq!(due_early, DrainStats::default());

        f.transport.script_failures(1);
        let stats = f
            .dispatcher
            .drain_due(now + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stats.rescheduled, 1);

        // Second retry lands 2s after that
        let dead = f.queue.dead_letters(10).await.unwrap();
        assert!(dead.is_empty());
        let _ = item_id;
    }

    #[tokio::test]
    async fn fifth_failed_attempt_dead_letters() {
        let f = fixture(Channel::Email);
        let (occurrence_id, item_id) = seed(&f, Channel::Email).await;
        f.transport.script_failures(5);

        // Four rescheduled attempts, then the fifth failure is final
        let mut now = Utc::now();
        let mut stats = DrainStats::default();
        for _ in 0..5 {
            let pass = f.dispatcher.drain_due(now).await.unwrap();
            stats.rescheduled += pass.rescheduled;
            stats.dead_lettered += pass.dead_lettered;
            now += ChronoDuration::seconds(20);
        }
        assert_eq!(stats.rescheduled, 4);
        assert_eq!(stats.dead_lettered, 1);

        // No sixth automatic attempt
        let after = f.dispatcher.drain_due(now).await.unwrap();
        assert_eq!(after, DrainStats::default());
        assert_eq!(f.transport.delivered.lock().len(), 5);

        let dead = f.queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, item_id);
        assert_eq!(dead[0].status, DeliveryStatus::DeadLetter);
        assert!(dead[0].error.as_deref().unwrap().contains("provider down"));

        let occurrence = f.occurrences.get(occurrence_id).await.unwrap().unwrap();
        assert!(occurrence.notified_at.is_none());
    }
}
