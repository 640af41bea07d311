// Canonical death event - the wire format shared by the poller, the
// ingestion endpoint and the event bus.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// A detected death, normalized from the source record.
///
/// Immutable once built: the poller owns it until it is handed to the bus.
/// Serialized as flat JSON with ISO-8601 timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DeathEvent {
    /// Opaque identifier from the origin system, used for dedup
    pub source_id: String,
    pub tenant_id: Uuid,
    pub hospital_id: Uuid,
    /// Display name of the origin hospital, stamped at ingestion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hospital_name: Option<String>,
    pub death_time: DateTime<Utc>,
    pub cause_of_death: String,
    /// Age in years at time of death
    pub age: i32,
    /// Masked patient identifier (never the raw document number)
    pub masked_patient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_number: Option<String>,
    /// When the poller detected the record
    pub detected_at: DateTime<Utc>,
}

impl DeathEvent {
    /// Validate the fields the ingestion endpoint requires.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_id.trim().is_empty() {
            return Err(ValidationError::MissingField("source_id"));
        }
        if self.cause_of_death.trim().is_empty() {
            return Err(ValidationError::MissingField("cause_of_death"));
        }
        if self.masked_patient_id.trim().is_empty() {
            return Err(ValidationError::MissingField("masked_patient_id"));
        }
        if !(0..=150).contains(&self.age) {
            return Err(ValidationError::InvalidValue {
                field: "age",
                reason: format!("{} out of range", self.age),
            });
        }
        Ok(())
    }

    /// Hours elapsed since the death, as seen at `now`
    pub fn elapsed_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.death_time).num_seconds() as f64 / 3600.0
    }

    /// Time left inside the capture window, zero when expired
    pub fn time_remaining(&self, window_hours: i64, now: DateTime<Utc>) -> Duration {
        let deadline = self.death_time + Duration::hours(window_hours);
        (deadline - now).max(Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> DeathEvent {
        DeathEvent {
            source_id: "OB-1001".into(),
            tenant_id: Uuid::now_v7(),
            hospital_id: Uuid::now_v7(),
            hospital_name: Some("Hospital Geral".into()),
            death_time: Utc::now() - Duration::hours(2),
            cause_of_death: "Infarto Fulminante".into(),
            age: 45,
            masked_patient_id: "***456".into(),
            sector: Some("UTI".into()),
            bed: None,
            record_number: None,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn validates_required_fields() {
        assert!(event().validate().is_ok());

        let mut missing = event();
        missing.source_id = "  ".into();
        assert!(matches!(
            missing.validate(),
            Err(ValidationError::MissingField("source_id"))
        ));

        let mut bad_age = event();
        bad_age.age = 900;
        assert!(bad_age.validate().is_err());
    }

    #[test]
    fn time_remaining_clamps_at_zero() {
        let e = event();
        let now = e.death_time + Duration::hours(10);
        assert_eq!(e.time_remaining(6, now), Duration::zero());

        let now = e.death_time + Duration::hours(4);
        assert_eq!(e.time_remaining(6, now), Duration::hours(2));
    }

    #[test]
    fn wire_format_is_flat_json() {
        let e = event();
        let json = serde_json::to_value(&e).unwrap();
        for field in [
            "source_id",
            "tenant_id",
            "hospital_id",
            "death_time",
            "cause_of_death",
            "age",
            "masked_patient_id",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        let back: DeathEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }
}
