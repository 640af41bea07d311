// Real-time hub
//
// In-memory registry of connected SSE sessions. Broadcast filters by
// tenant at fan-out time and never blocks: a session whose buffer is
// full is dropped and has to reconnect.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use vigil_core::{RealtimeBroadcast, RealtimeEvent};

/// Per-session buffer; a session this far behind is dropped
pub const SUBSCRIBER_BUFFER: usize = 64;

struct Subscription {
    tenant_id: Uuid,
    sender: mpsc::Sender<RealtimeEvent>,
}

#[derive(Default)]
pub struct RealtimeHub {
    sessions: RwLock<HashMap<Uuid, Subscription>>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session scoped to one tenant. The returned id must be
    /// passed to `unsubscribe` when the stream ends.
    pub fn subscribe(&self, tenant_id: Uuid) -> (Uuid, mpsc::Receiver<RealtimeEvent>) {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::now_v7();
        self.sessions
            .write()
            .insert(id, Subscription { tenant_id, sender });
        debug!(session = %id, %tenant_id, "sse session registered");
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if self.sessions.write().remove(&id).is_some() {
            debug!(session = %id, "sse session deregistered");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl RealtimeBroadcast for RealtimeHub {
    fn broadcast(&self, event: RealtimeEvent) {
        let tenant_id = event.tenant_id();
        let mut dropped = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, sub) in sessions.iter() {
                if sub.tenant_id != tenant_id {
                    continue;
                }
                if sub.sender.try_send(event.clone()).is_err() {
                    dropped.push(*id);
                }
            }
        }
        if !dropped.is_empty() {
            let mut sessions = self.sessions.write();
            for id in dropped {
                sessions.remove(&id);
                warn!(session = %id, "dropped sse session (buffer full or gone)");
            }
        }
    }
}
