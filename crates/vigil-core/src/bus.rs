// Event bus and sink contracts
//
// The bus is an ordered, durable, at-least-once log decoupling detection
// from consumption. Consumers read through named groups and ack offsets;
// unacked records are redelivered.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BusError, SinkError};
use crate::event::DeathEvent;
use crate::occurrence::Occurrence;

/// One record read from the stream
#[derive(Debug, Clone)]
pub struct BusRecord {
    /// Monotonic offset within the stream
    pub offset: u64,
    pub event: DeathEvent,
}

/// Ordered, durable, at-least-once event log.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append an event; returns its offset.
    async fn publish(&self, event: &DeathEvent) -> Result<u64, BusError>;

    /// Read up to `max` records for a consumer group. Records stay
    /// in-flight until acked and are redelivered after a visibility
    /// timeout; delivery within one read is in offset order.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<BusRecord>, BusError>;

    /// Acknowledge one offset for a group.
    async fn ack(&self, group: &str, offset: u64) -> Result<(), BusError>;

    /// Unacked records for a group (health gauge).
    async fn lag(&self, group: &str) -> Result<u64, BusError>;
}

/// Where a poller publishes canonical events: the in-process bus, or the
/// central ingestion endpoint when running on-premise.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish_event(&self, event: &DeathEvent) -> Result<(), SinkError>;
}

/// Adapter so any bus can serve as the poller's sink.
pub struct BusSink<B>(pub B);

#[async_trait]
impl<B: EventBus> EventSink for BusSink<B> {
    async fn publish_event(&self, event: &DeathEvent) -> Result<(), SinkError> {
        self.0
            .publish(event)
            .await
            .map(|_| ())
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }
}

/// Typed events pushed to connected dashboard sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    OccurrenceCreated { occurrence: Occurrence },
    OccurrenceUpdated { occurrence: Occurrence },
}

impl RealtimeEvent {
    pub fn tenant_id(&self) -> uuid::Uuid {
        match self {
            RealtimeEvent::OccurrenceCreated { occurrence }
            | RealtimeEvent::OccurrenceUpdated { occurrence } => occurrence.tenant_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            RealtimeEvent::OccurrenceCreated { .. } => "occurrence_created",
            RealtimeEvent::OccurrenceUpdated { .. } => "occurrence_updated",
        }
    }
}

/// Fan-out seam between the triage motor and the real-time hub.
pub trait RealtimeBroadcast: Send + Sync {
    /// Must never block on slow consumers.
    fn broadcast(&self, event: RealtimeEvent);
}

/// No-op broadcast for deployments without a dashboard (standalone worker).
pub struct NoopBroadcast;

impl RealtimeBroadcast for NoopBroadcast {
    fn broadcast(&self, _event: RealtimeEvent) {}
}
