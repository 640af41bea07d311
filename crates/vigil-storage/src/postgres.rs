// Postgres backend with sqlx runtime queries
//
// One `Database` handle implements every store trait plus the event bus.
// Uniqueness constraints in the schema carry the idempotency guarantees;
// the queries lean on ON CONFLICT DO NOTHING and conditional UPDATEs
// instead of application-side locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use vigil_core::{
    ApiKeyStore, BusError, BusRecord, Channel, DeathEvent, DeliveryStatus, EnqueueRequest,
    EventBus, HistoryAction, HistoryEntry, IngestIdentity, NewOccurrence, NotificationQueue,
    Occurrence, OccurrenceStatus, OccurrenceStore, QueueDepth, QueueItem, Recipient,
    RecipientStore, RuleKind, StoreError, TriageRule, TriageRuleStore,
};

/// How long a claimed queue item or unacked bus record stays invisible
/// to other workers, in seconds. Mirrors the in-memory backend.
const VISIBILITY_SECS: i64 = 30;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations.
    pub async fn from_url(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::database(e.to_string())
}

// ============================================
// Row models
// ============================================

#[derive(sqlx::FromRow)]
struct OccurrenceRow {
    id: Uuid,
    tenant_id: Uuid,
    hospital_id: Uuid,
    source_event_ref: String,
    status: String,
    priority_score: i32,
    masked_patient_id: String,
    sector: Option<String>,
    death_time: DateTime<Utc>,
    event: serde_json::Value,
    outcome: Option<String>,
    notified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OccurrenceRow {
    fn into_occurrence(self) -> Result<Occurrence, StoreError> {
        let status = OccurrenceStatus::parse(&self.status).ok_or_else(|| {
            StoreError::serialization(format!("unknown occurrence status {:?}", self.status))
        })?;
        Ok(Occurrence {
            id: self.id,
            tenant_id: self.tenant_id,
            hospital_id: self.hospital_id,
            source_event_ref: self.source_event_ref,
            status,
            priority_score: self.priority_score,
            masked_patient_id: self.masked_patient_id,
            sector: self.sector,
            death_time: self.death_time,
            event: self.event,
            outcome: self.outcome,
            notified_at: self.notified_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const OCCURRENCE_COLUMNS: &str = "id, tenant_id, hospital_id, source_event_ref, status, \
     priority_score, masked_patient_id, sector, death_time, event, outcome, notified_at, \
     created_at, updated_at";

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    occurrence_id: Uuid,
    actor: Option<Uuid>,
    action: String,
    status_from: Option<String>,
    status_to: Option<String>,
    at: DateTime<Utc>,
}

impl HistoryRow {
    fn into_entry(self) -> Result<HistoryEntry, StoreError> {
        let action = match self.action.as_str() {
            "created" => HistoryAction::Created,
            "status_changed" => HistoryAction::StatusChanged,
            "outcome_recorded" => HistoryAction::OutcomeRecorded,
            "notification_sent" => HistoryAction::NotificationSent,
            other => {
                return Err(StoreError::serialization(format!(
                    "unknown history action {other:?}"
                )))
            }
        };
        Ok(HistoryEntry {
            id: self.id,
            occurrence_id: self.occurrence_id,
            actor: self.actor,
            action,
            status_from: self.status_from.as_deref().and_then(OccurrenceStatus::parse),
            status_to: self.status_to.as_deref().and_then(OccurrenceStatus::parse),
            at: self.at,
        })
    }
}

fn history_action_str(action: HistoryAction) -> &'static str {
    match action {
        HistoryAction::Created => "created",
        HistoryAction::StatusChanged => "status_changed",
        HistoryAction::OutcomeRecorded => "outcome_recorded",
        HistoryAction::NotificationSent => "notification_sent",
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    kind: String,
    params: serde_json::Value,
    active: bool,
}

fn rule_kind_parse(s: &str) -> Option<RuleKind> {
    match s {
        "max_age" => Some(RuleKind::MaxAge),
        "excluded_causes" => Some(RuleKind::ExcludedCauses),
        "max_elapsed_hours" => Some(RuleKind::MaxElapsedHours),
        _ => None,
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    occurrence_id: Uuid,
    user_id: Uuid,
    channel: String,
    recipient: String,
    payload: serde_json::Value,
    retries: i32,
    status: String,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl QueueRow {
    fn into_item(self) -> Result<QueueItem, StoreError> {
        let channel = Channel::parse(&self.channel).ok_or_else(|| {
            StoreError::serialization(format!("unknown channel {:?}", self.channel))
        })?;
        let status = DeliveryStatus::parse(&self.status).ok_or_else(|| {
            StoreError::serialization(format!("unknown delivery status {:?}", self.status))
        })?;
        let payload = serde_json::from_value(self.payload)
            .map_err(|e| StoreError::serialization(e.to_string()))?;
        Ok(QueueItem {
            id: self.id,
            occurrence_id: self.occurrence_id,
            user_id: self.user_id,
            channel,
            recipient: self.recipient,
            payload,
            retries: self.retries.max(0) as u32,
            status,
            created_at: self.created_at,
            last_attempt_at: self.last_attempt_at,
            next_retry_at: self.next_retry_at,
            error: self.error,
        })
    }
}

const QUEUE_COLUMNS: &str = "id, occurrence_id, user_id, channel, recipient, payload, retries, \
     status, created_at, last_attempt_at, next_retry_at, error";

// ============================================
// Occurrences
// ============================================

#[async_trait]
impl OccurrenceStore for Database {
    async fn create(&self, input: NewOccurrence) -> Result<Option<Occurrence>, StoreError> {
        let row = sqlx::query_as::<_, OccurrenceRow>(&format!(
            r#"
            INSERT INTO occurrences
                (id, tenant_id, hospital_id, source_event_ref, status, priority_score,
                 masked_patient_id, sector, death_time, event)
            VALUES ($1, $2, $3, $4, 'PENDENTE', $5, $6, $7, $8, $9)
            ON CONFLICT (hospital_id, source_event_ref) DO NOTHING
            RETURNING {OCCURRENCE_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(input.tenant_id)
        .bind(input.hospital_id)
        .bind(&input.source_event_ref)
        .bind(input.priority_score)
        .bind(&input.masked_patient_id)
        .bind(&input.sector)
        .bind(input.death_time)
        .bind(&input.event)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let occurrence = row.into_occurrence()?;

        sqlx::query(
            r#"
            INSERT INTO occurrence_history (id, occurrence_id, action, status_to)
            VALUES ($1, $2, 'created', 'PENDENTE')
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(occurrence.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Some(occurrence))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Occurrence>, StoreError> {
        let row = sqlx::query_as::<_, OccurrenceRow>(&format!(
            "SELECT {OCCURRENCE_COLUMNS} FROM occurrences WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(OccurrenceRow::into_occurrence).transpose()
    }

    async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<Occurrence>, StoreError> {
        let rows = sqlx::query_as::<_, OccurrenceRow>(&format!(
            r#"
            SELECT {OCCURRENCE_COLUMNS} FROM occurrences
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(OccurrenceRow::into_occurrence).collect()
    }

    async fn update_status(
        &self,
        id: Uuid,
        to: OccurrenceStatus,
        actor: Option<Uuid>,
    ) -> Result<Occurrence, StoreError> {
        let current = self.get(id).await?.ok_or(StoreError::NotFound(id))?;
        let from = current.status;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }

        // Guard on the old status so a concurrent transition loses cleanly
        let row = sqlx::query_as::<_, OccurrenceRow>(&format!(
            r#"
            UPDATE occurrences
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {OCCURRENCE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Err(StoreError::InvalidTransition { from, to });
        };
        let updated = row.into_occurrence()?;

        sqlx::query(
            r#"
            INSERT INTO occurrence_history (id, occurrence_id, actor, action, status_from, status_to)
            VALUES ($1, $2, $3, 'status_changed', $4, $5)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(id)
        .bind(actor)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(updated)
    }

    async fn set_outcome(&self, id: Uuid, outcome: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE occurrences SET outcome = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(outcome)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        sqlx::query(
            r#"
            INSERT INTO occurrence_history (id, occurrence_id, action)
            VALUES ($1, $2, 'outcome_recorded')
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn stamp_notified_at(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE occurrences
            SET notified_at = $2, updated_at = NOW()
            WHERE id = $1 AND notified_at IS NULL
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // Either already stamped or missing; the caller treats both the same
        // way only when the row exists.
        if self.get(id).await?.is_none() {
            return Err(StoreError::NotFound(id));
        }
        Ok(false)
    }

    async fn history(&self, id: Uuid) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, occurrence_id, actor, action, status_from, status_to, at
            FROM occurrence_history
            WHERE occurrence_id = $1
            ORDER BY at ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(HistoryRow::into_entry).collect()
    }
}

// ============================================
// Triage rules
// ============================================

#[async_trait]
impl TriageRuleStore for Database {
    async fn active_rules(&self, tenant_id: Uuid) -> Result<Vec<TriageRule>, StoreError> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, tenant_id, name, kind, params, active
            FROM triage_rules
            WHERE tenant_id = $1 AND active
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let kind = rule_kind_parse(&row.kind).ok_or_else(|| {
                    StoreError::serialization(format!("unknown rule kind {:?}", row.kind))
                })?;
                Ok(TriageRule {
                    id: row.id,
                    tenant_id: row.tenant_id,
                    name: row.name,
                    kind,
                    params: row.params,
                    active: row.active,
                })
            })
            .collect()
    }
}

// ============================================
// Notification queue
// ============================================

#[async_trait]
impl NotificationQueue for Database {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Option<Uuid>, StoreError> {
        let payload = serde_json::to_value(&request.payload)
            .map_err(|e| StoreError::serialization(e.to_string()))?;
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO notification_queue
                (id, occurrence_id, user_id, channel, recipient, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (occurrence_id, user_id, channel) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(request.occurrence_id)
        .bind(request.user_id)
        .bind(request.channel.as_str())
        .bind(&request.recipient)
        .bind(&payload)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|(id,)| id))
    }

    async fn claim_due(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        // SKIP LOCKED keeps concurrent workers of one channel from
        // claiming the same rows; claimed_at is the lease.
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            UPDATE notification_queue
            SET claimed_at = $2, last_attempt_at = $2
            WHERE id IN (
                SELECT id FROM notification_queue
                WHERE channel = $1
                  AND status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= $2)
                  AND (claimed_at IS NULL OR claimed_at <= $2 - make_interval(secs => $4))
                ORDER BY created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(channel.as_str())
        .bind(now)
        .bind(max as i64)
        .bind(VISIBILITY_SECS as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut items: Vec<QueueItem> = rows
            .into_iter()
            .map(QueueRow::into_item)
            .collect::<Result<_, _>>()?;
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    async fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_queue
            SET status = 'sent', last_attempt_at = $2, next_retry_at = NULL,
                error = NULL, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_queue
            SET retries = retries + 1, error = $2, next_retry_at = $3, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn mark_dead_letter(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_queue
            SET retries = retries + 1, status = 'dead_letter', error = $2,
                next_retry_at = NULL, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn depth(&self, channel: Channel) -> Result<QueueDepth, StoreError> {
        let (pending, dead_letter): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'dead_letter')
            FROM notification_queue
            WHERE channel = $1
            "#,
        )
        .bind(channel.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(QueueDepth {
            channel,
            pending: pending.max(0) as u64,
            dead_letter: dead_letter.max(0) as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            SELECT {QUEUE_COLUMNS} FROM notification_queue
            WHERE status = 'dead_letter'
            ORDER BY created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(QueueRow::into_item).collect()
    }

    async fn requeue_dead_letter(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_queue
            SET status = 'pending', retries = 0, next_retry_at = NULL,
                error = NULL, claimed_at = NULL
            WHERE id = $1 AND status = 'dead_letter'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

// ============================================
// Recipients and API keys
// ============================================

#[async_trait]
impl RecipientStore for Database {
    async fn on_duty(&self, tenant_id: Uuid) -> Result<Vec<Recipient>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct RecipientRow {
            user_id: Uuid,
            name: String,
            email: Option<String>,
            phone: Option<String>,
            push_token: Option<String>,
        }

        let rows = sqlx::query_as::<_, RecipientRow>(
            r#"
            SELECT user_id, name, email, phone, push_token
            FROM recipients
            WHERE tenant_id = $1 AND on_duty
            ORDER BY name ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| Recipient {
                user_id: r.user_id,
                name: r.name,
                email: r.email,
                phone: r.phone,
                push_token: r.push_token,
            })
            .collect())
    }
}

#[async_trait]
impl ApiKeyStore for Database {
    async fn resolve(&self, key_hash: &str) -> Result<Option<IngestIdentity>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct IdentityRow {
            tenant_id: Uuid,
            hospital_id: Uuid,
            hospital_name: String,
        }

        let row = sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT h.tenant_id, k.hospital_id, h.name AS hospital_name
            FROM api_keys k
            JOIN hospitals h ON h.id = k.hospital_id
            WHERE k.key_hash = $1 AND k.active
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| IngestIdentity {
            tenant_id: r.tenant_id,
            hospital_id: r.hospital_id,
            hospital_name: r.hospital_name,
        }))
    }
}

// ============================================
// Event bus
// ============================================

#[derive(sqlx::FromRow)]
struct BusRow {
    stream_offset: i64,
    payload: serde_json::Value,
}

impl BusRow {
    fn into_record(self) -> Result<BusRecord, BusError> {
        let offset = self.stream_offset as u64;
        let event: DeathEvent =
            serde_json::from_value(self.payload).map_err(|e| BusError::Malformed {
                offset,
                reason: e.to_string(),
            })?;
        Ok(BusRecord { offset, event })
    }
}

fn bus_err(e: sqlx::Error) -> BusError {
    BusError::Unavailable(e.to_string())
}

#[async_trait]
impl EventBus for Database {
    async fn publish(&self, event: &DeathEvent) -> Result<u64, BusError> {
        let payload = serde_json::to_value(event).map_err(|e| BusError::Malformed {
            offset: 0,
            reason: e.to_string(),
        })?;
        let (offset,): (i64,) = sqlx::query_as(
            "INSERT INTO bus_events (payload) VALUES ($1) RETURNING stream_offset",
        )
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .map_err(bus_err)?;
        Ok(offset as u64)
    }

    async fn read_group(
        &self,
        group: &str,
        _consumer: &str,
        max: usize,
    ) -> Result<Vec<BusRecord>, BusError> {
        let mut tx = self.pool.begin().await.map_err(bus_err)?;

        // Lock (and create on first read) the group cursor
        let (next,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO bus_groups (group_name, next_offset)
            VALUES ($1, 0)
            ON CONFLICT (group_name) DO UPDATE SET group_name = EXCLUDED.group_name
            RETURNING next_offset
            "#,
        )
        .bind(group)
        .fetch_one(&mut *tx)
        .await
        .map_err(bus_err)?;

        let mut records = Vec::new();

        // Expired in-flight records first, in offset order
        let stale = sqlx::query_as::<_, BusRow>(
            r#"
            UPDATE bus_inflight i
            SET claimed_at = NOW()
            FROM bus_events e
            WHERE i.stream_offset = e.stream_offset
              AND i.group_name = $1
              AND i.claimed_at <= NOW() - make_interval(secs => $3)
              AND i.stream_offset IN (
                  SELECT stream_offset FROM bus_inflight
                  WHERE group_name = $1
                    AND claimed_at <= NOW() - make_interval(secs => $3)
                  ORDER BY stream_offset ASC
                  LIMIT $2
              )
            RETURNING e.stream_offset, e.payload
            "#,
        )
        .bind(group)
        .bind(max as i64)
        .bind(VISIBILITY_SECS as f64)
        .fetch_all(&mut *tx)
        .await
        .map_err(bus_err)?;
        for row in stale {
            records.push(row.into_record()?);
        }
        records.sort_by_key(|r| r.offset);

        // Then fresh records past the cursor
        let remaining = max.saturating_sub(records.len());
        if remaining > 0 {
            let fresh = sqlx::query_as::<_, BusRow>(
                r#"
                SELECT stream_offset, payload FROM bus_events
                WHERE stream_offset >= $1
                ORDER BY stream_offset ASC
                LIMIT $2
                "#,
            )
            .bind(next)
            .bind(remaining as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(bus_err)?;

            let mut new_next = next;
            for row in fresh {
                let record = row.into_record()?;
                new_next = record.offset as i64 + 1;
                sqlx::query(
                    r#"
                    INSERT INTO bus_inflight (group_name, stream_offset, claimed_at)
                    VALUES ($1, $2, NOW())
                    "#,
                )
                .bind(group)
                .bind(record.offset as i64)
                .execute(&mut *tx)
                .await
                .map_err(bus_err)?;
                records.push(record);
            }
            if new_next != next {
                sqlx::query(
                    "UPDATE bus_groups SET next_offset = $2 WHERE group_name = $1",
                )
                .bind(group)
                .bind(new_next)
                .execute(&mut *tx)
                .await
                .map_err(bus_err)?;
            }
        }

        tx.commit().await.map_err(bus_err)?;
        Ok(records)
    }

    async fn ack(&self, group: &str, offset: u64) -> Result<(), BusError> {
        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT next_offset FROM bus_groups WHERE group_name = $1")
                .bind(group)
                .fetch_optional(&self.pool)
                .await
                .map_err(bus_err)?;
        if exists.is_none() {
            return Err(BusError::UnknownGroup(group.to_string()));
        }

        sqlx::query(
            "DELETE FROM bus_inflight WHERE group_name = $1 AND stream_offset = $2",
        )
        .bind(group)
        .bind(offset as i64)
        .execute(&self.pool)
        .await
        .map_err(bus_err)?;
        Ok(())
    }

    async fn lag(&self, group: &str) -> Result<u64, BusError> {
        let (lag,): (i64,) = sqlx::query_as(
            r#"
            SELECT
                COALESCE((SELECT MAX(stream_offset) + 1 FROM bus_events), 0)
                - COALESCE((SELECT next_offset FROM bus_groups WHERE group_name = $1), 0)
                + (SELECT COUNT(*) FROM bus_inflight WHERE group_name = $1)
            "#,
        )
        .bind(group)
        .fetch_one(&self.pool)
        .await
        .map_err(bus_err)?;
        Ok(lag.max(0) as u64)
    }
}
