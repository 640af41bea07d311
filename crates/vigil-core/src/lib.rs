// Core domain model for the Vigil pipeline
//
// Everything in this crate is DB-agnostic. Storage backends, the HTTP
// surface and the workers depend on the traits defined here; nothing
// here depends on them.

pub mod alert;
pub mod bus;
pub mod error;
pub mod event;
pub mod mask;
pub mod notification;
pub mod occurrence;
pub mod retry;
pub mod rules;
pub mod stores;

pub use alert::AlertLimiter;
pub use bus::{
    BusRecord, BusSink, EventBus, EventSink, NoopBroadcast, RealtimeBroadcast, RealtimeEvent,
};
pub use error::{BusError, SinkError, StoreError, ValidationError};
pub use event::DeathEvent;
pub use mask::{mask_identifier, mask_name};
pub use notification::{
    Channel, DeliveryStatus, EnqueueRequest, NotificationPayload, QueueDepth, QueueItem,
};
pub use occurrence::{
    HistoryAction, HistoryEntry, NewOccurrence, Occurrence, OccurrenceStatus,
};
pub use retry::{BackoffSchedule, RetryPolicy};
pub use rules::{evaluate, priority_score, window_hours, RuleKind, TriageOutcome, TriageRule};
pub use stores::{
    ApiKeyStore, IngestIdentity, NotificationQueue, OccurrenceStore, Recipient, RecipientStore,
    TriageRuleStore,
};
