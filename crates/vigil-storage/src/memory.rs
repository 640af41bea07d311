// In-memory implementations of the store and bus traits
//
// Same observable semantics as the Postgres backend so tests exercise
// the real contracts: tuple uniqueness, claim leases, redelivery.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use vigil_core::{
    BusError, BusRecord, Channel, DeathEvent, DeliveryStatus, EnqueueRequest, EventBus,
    HistoryAction, HistoryEntry, IngestIdentity, NewOccurrence, NotificationQueue, Occurrence,
    OccurrenceStatus, OccurrenceStore, QueueDepth, QueueItem, Recipient, RecipientStore,
    StoreError, TriageRule, TriageRuleStore,
};

/// How long a claimed queue item or an unacked bus record stays
/// invisible before it becomes eligible again.
const DEFAULT_VISIBILITY: Duration = Duration::from_secs(30);

// ============================================
// Occurrences
// ============================================

#[derive(Default)]
pub struct MemoryOccurrenceStore {
    occurrences: RwLock<HashMap<Uuid, Occurrence>>,
    history: RwLock<Vec<HistoryEntry>>,
}

impl MemoryOccurrenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_history(
        &self,
        occurrence_id: Uuid,
        actor: Option<Uuid>,
        action: HistoryAction,
        from: Option<OccurrenceStatus>,
        to: Option<OccurrenceStatus>,
    ) {
        self.history.write().push(HistoryEntry {
            id: Uuid::now_v7(),
            occurrence_id,
            actor,
            action,
            status_from: from,
            status_to: to,
            at: Utc::now(),
        });
    }
}

#[async_trait]
impl OccurrenceStore for MemoryOccurrenceStore {
    async fn create(&self, input: NewOccurrence) -> Result<Option<Occurrence>, StoreError> {
        let mut occurrences = self.occurrences.write();

        let duplicate = occurrences.values().any(|o| {
            o.hospital_id == input.hospital_id && o.source_event_ref == input.source_event_ref
        });
        if duplicate {
            return Ok(None);
        }

        let now = Utc::now();
        let occurrence = Occurrence {
            id: Uuid::now_v7(),
            tenant_id: input.tenant_id,
            hospital_id: input.hospital_id,
            source_event_ref: input.source_event_ref,
            status: OccurrenceStatus::Pendente,
            priority_score: input.priority_score,
            masked_patient_id: input.masked_patient_id,
            sector: input.sector,
            death_time: input.death_time,
            event: input.event,
            outcome: None,
            notified_at: None,
            created_at: now,
            updated_at: now,
        };
        occurrences.insert(occurrence.id, occurrence.clone());
        drop(occurrences);

        self.push_history(
            occurrence.id,
            None,
            HistoryAction::Created,
            None,
            Some(OccurrenceStatus::Pendente),
        );
        Ok(Some(occurrence))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Occurrence>, StoreError> {
        Ok(self.occurrences.read().get(&id).cloned())
    }

    async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<Occurrence>, StoreError> {
        let mut list: Vec<_> = self
            .occurrences
            .read()
            .values()
            .filter(|o| o.tenant_id == tenant_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn update_status(
        &self,
        id: Uuid,
        to: OccurrenceStatus,
        actor: Option<Uuid>,
    ) -> Result<Occurrence, StoreError> {
        let mut occurrences = self.occurrences.write();
        let occurrence = occurrences.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let from = occurrence.status;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        occurrence.status = to;
        occurrence.updated_at = Utc::now();
        let updated = occurrence.clone();
        drop(occurrences);

        self.push_history(id, actor, HistoryAction::StatusChanged, Some(from), Some(to));
        Ok(updated)
    }

    async fn set_outcome(&self, id: Uuid, outcome: &str) -> Result<(), StoreError> {
        let mut occurrences = self.occurrences.write();
        let occurrence = occurrences.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        occurrence.outcome = Some(outcome.to_string());
        occurrence.updated_at = Utc::now();
        drop(occurrences);

        self.push_history(id, None, HistoryAction::OutcomeRecorded, None, None);
        Ok(())
    }

    async fn stamp_notified_at(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut occurrences = self.occurrences.write();
        let occurrence = occurrences.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if occurrence.notified_at.is_some() {
            return Ok(false);
        }
        occurrence.notified_at = Some(at);
        occurrence.updated_at = Utc::now();
        Ok(true)
    }

    async fn history(&self, id: Uuid) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self
            .history
            .read()
            .iter()
            .filter(|h| h.occurrence_id == id)
            .cloned()
            .collect())
    }
}

// ============================================
// Triage rules
// ============================================

#[derive(Default)]
pub struct MemoryTriageRuleStore {
    rules: RwLock<Vec<TriageRule>>,
}

impl MemoryTriageRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, rule: TriageRule) {
        self.rules.write().push(rule);
    }

    pub fn clear(&self) {
        self.rules.write().clear();
    }
}

#[async_trait]
impl TriageRuleStore for MemoryTriageRuleStore {
    async fn active_rules(&self, tenant_id: Uuid) -> Result<Vec<TriageRule>, StoreError> {
        Ok(self
            .rules
            .read()
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.active)
            .cloned()
            .collect())
    }
}

// ============================================
// Notification queue
// ============================================

struct QueueItemState {
    item: QueueItem,
    /// Lease taken by claim_due; invisible until it expires
    claimed_at: Option<Instant>,
}

pub struct MemoryNotificationQueue {
    items: RwLock<HashMap<Uuid, QueueItemState>>,
    visibility: Duration,
}

impl Default for MemoryNotificationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNotificationQueue {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            visibility: DEFAULT_VISIBILITY,
        }
    }

    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn pending_count(&self, channel: Channel) -> usize {
        self.items
            .read()
            .values()
            .filter(|s| s.item.channel == channel && s.item.status == DeliveryStatus::Pending)
            .count()
    }
}

#[async_trait]
impl NotificationQueue for MemoryNotificationQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Option<Uuid>, StoreError> {
        let mut items = self.items.write();

        let duplicate = items.values().any(|s| {
            s.item.occurrence_id == request.occurrence_id
                && s.item.user_id == request.user_id
                && s.item.channel == request.channel
        });
        if duplicate {
            return Ok(None);
        }

        let item = QueueItem {
            id: Uuid::now_v7(),
            occurrence_id: request.occurrence_id,
            user_id: request.user_id,
            channel: request.channel,
            recipient: request.recipient,
            payload: request.payload,
            retries: 0,
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_retry_at: None,
            error: None,
        };
        let id = item.id;
        items.insert(
            id,
            QueueItemState {
                item,
                claimed_at: None,
            },
        );
        Ok(Some(id))
    }

    async fn claim_due(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let mut items = self.items.write();
        let clock = Instant::now();

        let mut due: Vec<&mut QueueItemState> = items
            .values_mut()
            .filter(|s| {
                s.item.channel == channel
                    && s.item.status == DeliveryStatus::Pending
                    && s.item.next_retry_at.map_or(true, |t| t <= now)
                    && s.claimed_at
                        .map_or(true, |c| clock.duration_since(c) >= self.visibility)
            })
            .collect();
        due.sort_by(|a, b| a.item.created_at.cmp(&b.item.created_at));

        let mut claimed = Vec::new();
        for state in due.into_iter().take(max) {
            state.claimed_at = Some(clock);
            state.item.last_attempt_at = Some(now);
            claimed.push(state.item.clone());
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut items = self.items.write();
        let state = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        state.item.status = DeliveryStatus::Sent;
        state.item.last_attempt_at = Some(at);
        state.item.next_retry_at = None;
        state.item.error = None;
        state.claimed_at = None;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut items = self.items.write();
        let state = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        state.item.retries += 1;
        state.item.error = Some(error.to_string());
        state.item.next_retry_at = Some(next_retry_at);
        state.claimed_at = None;
        Ok(())
    }

    async fn mark_dead_letter(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut items = self.items.write();
        let state = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        state.item.retries += 1;
        state.item.status = DeliveryStatus::DeadLetter;
        state.item.error = Some(error.to_string());
        state.item.next_retry_at = None;
        state.claimed_at = None;
        Ok(())
    }

    async fn depth(&self, channel: Channel) -> Result<QueueDepth, StoreError> {
        let items = self.items.read();
        let mut pending = 0u64;
        let mut dead_letter = 0u64;
        for s in items.values().filter(|s| s.item.channel == channel) {
            match s.item.status {
                DeliveryStatus::Pending => pending += 1,
                DeliveryStatus::DeadLetter => dead_letter += 1,
                DeliveryStatus::Sent => {}
            }
        }
        Ok(QueueDepth {
            channel,
            pending,
            dead_letter,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        let items = self.items.read();
        let mut dead: Vec<_> = items
            .values()
            .filter(|s| s.item.status == DeliveryStatus::DeadLetter)
            .map(|s| s.item.clone())
            .collect();
        dead.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn requeue_dead_letter(&self, id: Uuid) -> Result<(), StoreError> {
        let mut items = self.items.write();
        let state = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        state.item.status = DeliveryStatus::Pending;
        state.item.retries = 0;
        state.item.next_retry_at = None;
        state.item.error = None;
        state.claimed_at = None;
        Ok(())
    }
}

// ============================================
// Recipients and API keys
// ============================================

#[derive(Default)]
pub struct MemoryRecipientStore {
    by_tenant: RwLock<HashMap<Uuid, Vec<Recipient>>>,
}

impl MemoryRecipientStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, tenant_id: Uuid, recipient: Recipient) {
        self.by_tenant
            .write()
            .entry(tenant_id)
            .or_default()
            .push(recipient);
    }
}

#[async_trait]
impl RecipientStore for MemoryRecipientStore {
    async fn on_duty(&self, tenant_id: Uuid) -> Result<Vec<Recipient>, StoreError> {
        Ok(self
            .by_tenant
            .read()
            .get(&tenant_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryApiKeyStore {
    by_hash: RwLock<HashMap<String, IngestIdentity>>,
}

impl MemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key_hash: impl Into<String>, identity: IngestIdentity) {
        self.by_hash.write().insert(key_hash.into(), identity);
    }
}

#[async_trait]
impl vigil_core::ApiKeyStore for MemoryApiKeyStore {
    async fn resolve(&self, key_hash: &str) -> Result<Option<IngestIdentity>, StoreError> {
        Ok(self.by_hash.read().get(key_hash).cloned())
    }
}

// ============================================
// Event bus
// ============================================

struct GroupState {
    /// Next fresh offset to hand out
    next: u64,
    /// Offsets delivered but not yet acked, with claim time
    inflight: BTreeMap<u64, Instant>,
}

/// Ordered in-memory log with consumer groups and at-least-once
/// redelivery after a visibility timeout.
pub struct MemoryEventBus {
    log: RwLock<Vec<DeathEvent>>,
    groups: RwLock<HashMap<String, GroupState>>,
    visibility: Duration,
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self {
            log: RwLock::new(Vec::new()),
            groups: RwLock::new(HashMap::new()),
            visibility: DEFAULT_VISIBILITY,
        }
    }

    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: &DeathEvent) -> Result<u64, BusError> {
        let mut log = self.log.write();
        log.push(event.clone());
        Ok(log.len() as u64 - 1)
    }

    async fn read_group(
        &self,
        group: &str,
        _consumer: &str,
        max: usize,
    ) -> Result<Vec<BusRecord>, BusError> {
        let log = self.log.read();
        let mut groups = self.groups.write();
        let state = groups.entry(group.to_string()).or_insert(GroupState {
            next: 0,
            inflight: BTreeMap::new(),
        });

        let now = Instant::now();
        let mut records = Vec::new();

        // Expired in-flight records first, in offset order
        let stale: Vec<u64> = state
            .inflight
            .iter()
            .filter(|(_, claimed)| now.duration_since(**claimed) >= self.visibility)
            .map(|(offset, _)| *offset)
            .take(max)
            .collect();
        for offset in stale {
            state.inflight.insert(offset, now);
            records.push(BusRecord {
                offset,
                event: log[offset as usize].clone(),
            });
        }

        // Then fresh records
        while records.len() < max && (state.next as usize) < log.len() {
            let offset = state.next;
            state.inflight.insert(offset, now);
            records.push(BusRecord {
                offset,
                event: log[offset as usize].clone(),
            });
            state.next += 1;
        }

        Ok(records)
    }

    async fn ack(&self, group: &str, offset: u64) -> Result<(), BusError> {
        let mut groups = self.groups.write();
        let state = groups
            .get_mut(group)
            .ok_or_else(|| BusError::UnknownGroup(group.to_string()))?;
        state.inflight.remove(&offset);
        Ok(())
    }

    async fn lag(&self, group: &str) -> Result<u64, BusError> {
        let log_len = self.log.read().len() as u64;
        let groups = self.groups.read();
        Ok(match groups.get(group) {
            Some(state) => (log_len - state.next) + state.inflight.len() as u64,
            None => log_len,
        })
    }
}
