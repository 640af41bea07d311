// Store contracts implemented by vigil-storage (memory and Postgres)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::notification::{Channel, EnqueueRequest, QueueDepth, QueueItem};
use crate::occurrence::{HistoryEntry, NewOccurrence, Occurrence, OccurrenceStatus};
use crate::rules::TriageRule;

/// Occurrence persistence. `source_event_ref` uniqueness per hospital is
/// the system's idempotency boundary for at-least-once bus delivery.
#[async_trait]
pub trait OccurrenceStore: Send + Sync {
    /// Create an occurrence. Returns `None` when one already exists for
    /// the same (hospital_id, source_event_ref) - the expected duplicate
    /// branch, not an error.
    async fn create(&self, input: NewOccurrence) -> Result<Option<Occurrence>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Occurrence>, StoreError>;

    async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<Occurrence>, StoreError>;

    /// Validated status transition; records a history entry.
    async fn update_status(
        &self,
        id: Uuid,
        to: OccurrenceStatus,
        actor: Option<Uuid>,
    ) -> Result<Occurrence, StoreError>;

    /// Record the outcome at a terminal status.
    async fn set_outcome(&self, id: Uuid, outcome: &str) -> Result<(), StoreError>;

    /// First-successful-channel-wins stamp; returns true when this call
    /// set the field, false when it was already set.
    async fn stamp_notified_at(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn history(&self, id: Uuid) -> Result<Vec<HistoryEntry>, StoreError>;
}

/// Read-only triage rule access; the motor caches results with a TTL.
#[async_trait]
pub trait TriageRuleStore: Send + Sync {
    async fn active_rules(&self, tenant_id: Uuid) -> Result<Vec<TriageRule>, StoreError>;
}

/// Durable per-channel delivery queue.
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Idempotent on (occurrence_id, user_id, channel): returns `None`
    /// when the tuple already has a pending/sent/dead item.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Option<Uuid>, StoreError>;

    /// Claim up to `max` pending items of a channel whose
    /// `next_retry_at` is unset or <= `now`.
    async fn claim_due(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<QueueItem>, StoreError>;

    async fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Failed attempt that still has retries left: bump the retry count
    /// and schedule the next attempt.
    async fn reschedule(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Terminal failure; only explicit external intervention requeues it.
    async fn mark_dead_letter(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    async fn depth(&self, channel: Channel) -> Result<QueueDepth, StoreError>;

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError>;

    /// Manual remediation path: put a dead-lettered item back in play.
    async fn requeue_dead_letter(&self, id: Uuid) -> Result<(), StoreError>;
}

/// A staff member eligible to receive alerts right now
#[derive(Debug, Clone)]
pub struct Recipient {
    pub user_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub push_token: Option<String>,
}

impl Recipient {
    /// The address for a channel, when the recipient is reachable on it
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
            Channel::Push => self.push_token.as_deref(),
        }
    }
}

/// On-duty recipient resolution (shift roster + channel preferences,
/// collapsed into one read model).
#[async_trait]
pub trait RecipientStore: Send + Sync {
    async fn on_duty(&self, tenant_id: Uuid) -> Result<Vec<Recipient>, StoreError>;
}

/// Identity resolved from a per-hospital ingestion API key
#[derive(Debug, Clone)]
pub struct IngestIdentity {
    pub tenant_id: Uuid,
    pub hospital_id: Uuid,
    pub hospital_name: String,
}

/// API key lookup by sha256 hex digest; raw keys are never stored.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn resolve(&self, key_hash: &str) -> Result<Option<IngestIdentity>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_addresses_follow_channels() {
        let r = Recipient {
            user_id: Uuid::now_v7(),
            name: "Ana".into(),
            email: Some("ana@example.org".into()),
            phone: None,
            push_token: Some("tok-1".into()),
        };
        assert_eq!(r.address_for(Channel::Email), Some("ana@example.org"));
        assert_eq!(r.address_for(Channel::Sms), None);
        assert_eq!(r.address_for(Channel::Push), Some("tok-1"));
    }
}
