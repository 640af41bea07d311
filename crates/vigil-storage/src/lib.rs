// Storage backends for the vigil-core traits
//
// - memory: parking_lot-guarded maps, same semantics as Postgres. Used by
//   tests and by single-process deployments without a DATABASE_URL.
// - postgres: sqlx runtime queries (no compile-time macros), unique keys
//   enforcing the idempotency boundaries.

pub mod memory;
pub mod postgres;

pub use memory::{
    MemoryApiKeyStore, MemoryEventBus, MemoryNotificationQueue, MemoryOccurrenceStore,
    MemoryRecipientStore, MemoryTriageRuleStore,
};
pub use postgres::Database;
