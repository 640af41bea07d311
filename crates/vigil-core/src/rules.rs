// Tenant triage rules and their evaluation
//
// Evaluation is a pure function over (event, rules, now) so it can be
// tested without any storage or clock plumbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::event::DeathEvent;

/// Default capture window used for urgency scoring when no
/// max-elapsed-hours rule is configured.
pub const DEFAULT_WINDOW_HOURS: i64 = 6;

/// Rule types, evaluated in this declaration order. All are exclusionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum RuleKind {
    /// Reject events above an age ceiling; params: {"max_age": 80}
    MaxAge,
    /// Reject causes matching any pattern; params: {"causes": ["sepse", ...]}
    ExcludedCauses,
    /// Reject events older than the capture window; params: {"hours": 6}
    MaxElapsedHours,
}

impl RuleKind {
    /// Fixed evaluation order
    pub const ORDER: [RuleKind; 3] = [
        RuleKind::MaxAge,
        RuleKind::ExcludedCauses,
        RuleKind::MaxElapsedHours,
    ];
}

/// A tenant-scoped triage rule. Parameters are free-form JSON validated
/// at evaluation time; a malformed rule is skipped with a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TriageRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub kind: RuleKind,
    pub params: serde_json::Value,
    pub active: bool,
}

/// Result of evaluating a rule set against one event
#[derive(Debug, Clone, PartialEq)]
pub struct TriageOutcome {
    pub eligible: bool,
    pub reasons: Vec<String>,
    pub rules_applied: Vec<String>,
    /// Priority score, only meaningful when eligible
    pub score: i32,
}

#[derive(Deserialize)]
struct MaxAgeParams {
    max_age: i32,
}

#[derive(Deserialize)]
struct ExcludedCausesParams {
    causes: Vec<String>,
}

#[derive(Deserialize)]
struct MaxElapsedParams {
    hours: i64,
}

/// Evaluate all active rules for a tenant against one event.
///
/// Rules run grouped by kind in [`RuleKind::ORDER`]. Any single exclusion
/// fails the event; malformed rule parameters never block the remaining
/// rules.
pub fn evaluate(event: &DeathEvent, rules: &[TriageRule], now: DateTime<Utc>) -> TriageOutcome {
    let mut outcome = TriageOutcome {
        eligible: true,
        reasons: Vec::new(),
        rules_applied: Vec::new(),
        score: 0,
    };
    let mut window_hours = DEFAULT_WINDOW_HOURS;

    for kind in RuleKind::ORDER {
        for rule in rules.iter().filter(|r| r.active && r.kind == kind) {
            match apply_rule(event, rule, now) {
                Ok(Some(reason)) => {
                    outcome.eligible = false;
                    outcome.reasons.push(reason);
                    outcome.rules_applied.push(rule.name.clone());
                }
                Ok(None) => {
                    outcome.rules_applied.push(rule.name.clone());
                    if rule.kind == RuleKind::MaxElapsedHours {
                        if let Ok(p) =
                            serde_json::from_value::<MaxElapsedParams>(rule.params.clone())
                        {
                            window_hours = p.hours;
                        }
                    }
                }
                Err(reason) => {
                    warn!(rule = %rule.name, %reason, "skipping malformed triage rule");
                }
            }
        }
    }

    if outcome.eligible {
        outcome.score = priority_score(event, window_hours, now);
    }
    outcome
}

/// Apply one rule. `Ok(Some(reason))` means the event is excluded,
/// `Ok(None)` means it passed, `Err` means the rule itself is malformed.
fn apply_rule(
    event: &DeathEvent,
    rule: &TriageRule,
    now: DateTime<Utc>,
) -> Result<Option<String>, String> {
    match rule.kind {
        RuleKind::MaxAge => {
            let p: MaxAgeParams =
                serde_json::from_value(rule.params.clone()).map_err(|e| e.to_string())?;
            if event.age > p.max_age {
                Ok(Some(format!("age {} above ceiling {}", event.age, p.max_age)))
            } else {
                Ok(None)
            }
        }
        RuleKind::ExcludedCauses => {
            let p: ExcludedCausesParams =
                serde_json::from_value(rule.params.clone()).map_err(|e| e.to_string())?;
            // Case-insensitive substring match over free-text causes
            let cause = event.cause_of_death.to_lowercase();
            for pattern in &p.causes {
                if !pattern.is_empty() && cause.contains(&pattern.to_lowercase()) {
                    return Ok(Some(format!("excluded cause matched: {pattern}")));
                }
            }
            Ok(None)
        }
        RuleKind::MaxElapsedHours => {
            let p: MaxElapsedParams =
                serde_json::from_value(rule.params.clone()).map_err(|e| e.to_string())?;
            if p.hours <= 0 {
                return Err(format!("non-positive window: {}", p.hours));
            }
            if event.elapsed_hours(now) > p.hours as f64 {
                Ok(Some(format!("outside {}h capture window", p.hours)))
            } else {
                Ok(None)
            }
        }
    }
}

/// The capture window configured by an active max-elapsed-hours rule,
/// or the default when none parses.
pub fn window_hours(rules: &[TriageRule]) -> i64 {
    rules
        .iter()
        .filter(|r| r.active && r.kind == RuleKind::MaxElapsedHours)
        .find_map(|r| serde_json::from_value::<MaxElapsedParams>(r.params.clone()).ok())
        .map(|p| p.hours)
        .filter(|h| *h > 0)
        .unwrap_or(DEFAULT_WINDOW_HOURS)
}

/// Priority score: base by sector plus an urgency bump by time left in
/// the capture window, capped at 100.
pub fn priority_score(event: &DeathEvent, window_hours: i64, now: DateTime<Utc>) -> i32 {
    let base = match event.sector.as_deref() {
        Some(s) => sector_score(s),
        None => 50,
    };

    let remaining = event.time_remaining(window_hours, now);
    let bump = match remaining.num_minutes() {
        0 => 0,
        m if m <= 60 => 20,
        m if m <= 120 => 10,
        m if m <= 180 => 5,
        _ => 0,
    };

    (base + bump).min(100)
}

fn sector_score(sector: &str) -> i32 {
    let s = sector.to_lowercase();
    if s.contains("uti") || s.contains("icu") {
        90
    } else if s.contains("cirurgic") || s.contains("surgery") {
        85
    } else if s.contains("emergencia") || s.contains("emergency") || s.contains("pronto") {
        80
    } else {
        50
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(age: i32, cause: &str, hours_ago: i64) -> DeathEvent {
        DeathEvent {
            source_id: "OB-1".into(),
            tenant_id: Uuid::now_v7(),
            hospital_id: Uuid::now_v7(),
            hospital_name: None,
            death_time: Utc::now() - Duration::hours(hours_ago),
            cause_of_death: cause.into(),
            age,
            masked_patient_id: "***123".into(),
            sector: Some("UTI".into()),
            bed: None,
            record_number: None,
            detected_at: Utc::now(),
        }
    }

    fn rule(kind: RuleKind, params: serde_json::Value) -> TriageRule {
        TriageRule {
            id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            name: format!("{kind:?}"),
            kind,
            params,
            active: true,
        }
    }

    #[test]
    fn eligible_event_passes_and_scores() {
        // Scenario A: age 45, "Infarto Fulminante", max_age=80
        let rules = vec![rule(RuleKind::MaxAge, serde_json::json!({"max_age": 80}))];
        let out = evaluate(&event(45, "Infarto Fulminante", 1), &rules, Utc::now());
        assert!(out.eligible);
        assert!(out.score >= 90, "ICU base score expected, got {}", out.score);
    }

    #[test]
    fn age_above_ceiling_is_excluded() {
        // Scenario B: age 95 with the same ruleset
        let rules = vec![rule(RuleKind::MaxAge, serde_json::json!({"max_age": 80}))];
        let out = evaluate(&event(95, "Infarto Fulminante", 1), &rules, Utc::now());
        assert!(!out.eligible);
        assert_eq!(out.reasons.len(), 1);
    }

    #[test]
    fn excluded_cause_matches_case_insensitive_substring() {
        let rules = vec![rule(
            RuleKind::ExcludedCauses,
            serde_json::json!({"causes": ["Sepse", "neoplasia"]}),
        )];
        let out = evaluate(&event(40, "choque septico por SEPSE grave", 1), &rules, Utc::now());
        assert!(!out.eligible);

        let out = evaluate(&event(40, "trauma craniano", 1), &rules, Utc::now());
        assert!(out.eligible);
    }

    #[test]
    fn elapsed_window_excludes_old_events() {
        let rules = vec![rule(RuleKind::MaxElapsedHours, serde_json::json!({"hours": 6}))];
        assert!(!evaluate(&event(40, "x", 8), &rules, Utc::now()).eligible);
        assert!(evaluate(&event(40, "x", 2), &rules, Utc::now()).eligible);
    }

    #[test]
    fn malformed_rule_is_skipped_not_fatal() {
        let rules = vec![
            rule(RuleKind::MaxAge, serde_json::json!({"wrong_key": true})),
            rule(RuleKind::ExcludedCauses, serde_json::json!({"causes": ["sepse"]})),
        ];
        // Malformed max-age rule must not block the excluded-cause rule
        let out = evaluate(&event(95, "sepse", 1), &rules, Utc::now());
        assert!(!out.eligible);
        assert_eq!(out.rules_applied, vec!["ExcludedCauses".to_string()]);
    }

    #[test]
    fn exclusion_wins_regardless_of_other_rules() {
        // An over-age event never produces an eligible outcome
        let rules = vec![
            rule(RuleKind::MaxAge, serde_json::json!({"max_age": 80})),
            rule(RuleKind::MaxElapsedHours, serde_json::json!({"hours": 48})),
        ];
        let out = evaluate(&event(81, "ok", 1), &rules, Utc::now());
        assert!(!out.eligible);
    }

    #[test]
    fn inactive_rules_are_ignored() {
        let mut r = rule(RuleKind::MaxAge, serde_json::json!({"max_age": 10}));
        r.active = false;
        let out = evaluate(&event(95, "x", 1), &[r], Utc::now());
        assert!(out.eligible);
    }

    #[test]
    fn score_is_capped_and_bumped_by_urgency() {
        let mut e = event(40, "x", 5); // ~1h left in a 6h window
        e.sector = Some("UTI Adulto".into());
        let score = priority_score(&e, 6, Utc::now());
        assert_eq!(score, 100); // 90 base + 20 urgency, capped

        e.sector = Some("Enfermaria".into());
        let score = priority_score(&e, 6, Utc::now());
        assert_eq!(score, 70); // 50 base + 20 urgency
    }
}
