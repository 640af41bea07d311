// Occurrence - the tracked ticket opened for an eligible death event

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Occurrence workflow status.
///
/// PENDENTE -> EM_ANDAMENTO -> {ACEITA, RECUSADA} -> CONCLUIDA, with
/// CANCELADA reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum OccurrenceStatus {
    #[serde(rename = "PENDENTE")]
    Pendente,
    #[serde(rename = "EM_ANDAMENTO")]
    EmAndamento,
    #[serde(rename = "ACEITA")]
    Aceita,
    #[serde(rename = "RECUSADA")]
    Recusada,
    #[serde(rename = "CANCELADA")]
    Cancelada,
    #[serde(rename = "CONCLUIDA")]
    Concluida,
}

impl OccurrenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pendente => "PENDENTE",
            Self::EmAndamento => "EM_ANDAMENTO",
            Self::Aceita => "ACEITA",
            Self::Recusada => "RECUSADA",
            Self::Cancelada => "CANCELADA",
            Self::Concluida => "CONCLUIDA",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDENTE" => Some(Self::Pendente),
            "EM_ANDAMENTO" => Some(Self::EmAndamento),
            "ACEITA" => Some(Self::Aceita),
            "RECUSADA" => Some(Self::Recusada),
            "CANCELADA" => Some(Self::Cancelada),
            "CONCLUIDA" => Some(Self::Concluida),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Concluida | Self::Cancelada)
    }

    /// Valid transitions out of this status
    pub fn can_transition_to(&self, target: OccurrenceStatus) -> bool {
        use OccurrenceStatus::*;
        match self {
            Pendente => matches!(target, EmAndamento | Cancelada),
            EmAndamento => matches!(target, Aceita | Recusada | Cancelada),
            Aceita => matches!(target, Concluida | Cancelada),
            Recusada => matches!(target, Concluida | Cancelada),
            Cancelada | Concluida => false,
        }
    }
}

impl std::fmt::Display for OccurrenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tracked ticket created when a death event passes triage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Occurrence {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub hospital_id: Uuid,
    /// The originating DeathEvent's source_id; unique per hospital
    pub source_event_ref: String,
    pub status: OccurrenceStatus,
    pub priority_score: i32,
    pub masked_patient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    pub death_time: DateTime<Utc>,
    /// Full normalized event, kept for the dashboard detail view
    pub event: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an occurrence (triage motor only)
#[derive(Debug, Clone)]
pub struct NewOccurrence {
    pub tenant_id: Uuid,
    pub hospital_id: Uuid,
    pub source_event_ref: String,
    pub priority_score: i32,
    pub masked_patient_id: String,
    pub sector: Option<String>,
    pub death_time: DateTime<Utc>,
    pub event: serde_json::Value,
}

/// Audited actions on an occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    StatusChanged,
    OutcomeRecorded,
    NotificationSent,
}

/// One entry of the occurrence status-change history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HistoryEntry {
    pub id: Uuid,
    pub occurrence_id: Uuid,
    /// None for system-initiated actions
    pub actor: Option<Uuid>,
    pub action: HistoryAction,
    pub status_from: Option<OccurrenceStatus>,
    pub status_to: Option<OccurrenceStatus>,
    pub at: DateTime<Utc>,
}
