// Source record -> canonical event
//
// Masking happens here, before anything leaves the hospital network:
// the raw name and document numbers never appear in the outgoing event.

use chrono::{DateTime, Datelike, Utc};
use vigil_core::{mask_identifier, DeathEvent, ValidationError};

use crate::connector::SourceRecord;

/// Identity stamped on every event this agent emits
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub tenant_id: uuid::Uuid,
    pub hospital_id: uuid::Uuid,
    pub hospital_name: String,
}

pub fn normalize(
    record: &SourceRecord,
    identity: &AgentIdentity,
    detected_at: DateTime<Utc>,
) -> Result<DeathEvent, ValidationError> {
    let age = derive_age(record)?;

    let identifier = record
        .document_id
        .as_deref()
        .or(record.national_health_id.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MissingField("patient identifier"))?;

    let event = DeathEvent {
        source_id: record.source_id.trim().to_string(),
        tenant_id: identity.tenant_id,
        hospital_id: identity.hospital_id,
        hospital_name: Some(identity.hospital_name.clone()),
        death_time: record.death_time,
        cause_of_death: record.cause_of_death.trim().to_string(),
        age,
        masked_patient_id: mask_identifier(identifier),
        sector: clean(&record.sector),
        bed: clean(&record.bed),
        record_number: record.record_number.as_deref().map(mask_identifier),
        detected_at,
    };
    event.validate()?;
    Ok(event)
}

/// Explicit age column wins; otherwise compute whole years from the
/// birth date at the time of death.
fn derive_age(record: &SourceRecord) -> Result<i32, ValidationError> {
    if let Some(age) = record.age {
        return Ok(age);
    }
    let birth = record
        .birth_date
        .ok_or(ValidationError::MissingField("age"))?;
    let death = record.death_time.date_naive();

    let mut age = death.year() - birth.year();
    if (death.month(), death.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    if age < 0 {
        return Err(ValidationError::InvalidValue {
            field: "age",
            reason: format!("birth date {birth} after death"),
        });
    }
    Ok(age)
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn identity() -> AgentIdentity {
        AgentIdentity {
            tenant_id: Uuid::now_v7(),
            hospital_id: Uuid::now_v7(),
            hospital_name: "Hospital Geral".into(),
        }
    }

    fn record() -> SourceRecord {
        SourceRecord {
            source_id: "OB-1".into(),
            patient_name: "Maria da Silva".into(),
            death_time: "2026-03-10T14:30:00Z".parse().unwrap(),
            cause_of_death: "Infarto agudo".into(),
            birth_date: None,
            age: Some(67),
            national_health_id: None,
            document_id: Some("12345678901".into()),
            sector: Some(" UTI ".into()),
            bed: None,
            record_number: None,
        }
    }

    #[test]
    fn masks_identifier_and_trims_fields() {
        let event = normalize(&record(), &identity(), Utc::now()).unwrap();
        assert_eq!(event.masked_patient_id, "********901");
        assert_eq!(event.sector.as_deref(), Some("UTI"));
        assert_eq!(event.hospital_name.as_deref(), Some("Hospital Geral"));
        // The raw name never reaches the event
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("Maria"));
    }

    #[test]
    fn age_computed_from_birth_date_when_unmapped() {
        let mut r = record();
        r.age = None;
        r.birth_date = Some(NaiveDate::from_ymd_opt(1960, 3, 11).unwrap());
        // Birthday is one day after the 2026-03-10 death: still 65
        let event = normalize(&r, &identity(), Utc::now()).unwrap();
        assert_eq!(event.age, 65);

        r.birth_date = Some(NaiveDate::from_ymd_opt(1960, 3, 10).unwrap());
        let event = normalize(&r, &identity(), Utc::now()).unwrap();
        assert_eq!(event.age, 66);
    }

    #[test]
    fn missing_age_sources_fail_validation() {
        let mut r = record();
        r.age = None;
        r.birth_date = None;
        assert!(matches!(
            normalize(&r, &identity(), Utc::now()),
            Err(ValidationError::MissingField("age"))
        ));
    }

    #[test]
    fn missing_identifier_fails_validation() {
        let mut r = record();
        r.document_id = None;
        assert!(matches!(
            normalize(&r, &identity(), Utc::now()),
            Err(ValidationError::MissingField("patient identifier"))
        ));
    }
}
