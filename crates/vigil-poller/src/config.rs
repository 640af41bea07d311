// Agent configuration: a YAML file with ${ENV_VAR} substitution for
// secrets, validated up front so the poll loop never sees a partial
// mapping.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub database: DatabaseConfig,
    pub mapping: MappingConfig,
    pub central: CentralConfig,
    pub agent: AgentSettings,
}

/// Connection to the hospital records database (read-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// "postgres" or "mysql"
    pub driver: String,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Supports ${ENV_VAR} syntax
    #[serde(default)]
    pub password: String,
    /// postgres only: disable, require, verify-full
    #[serde(default)]
    pub ssl_mode: Option<String>,
}

impl DatabaseConfig {
    pub fn dsn(&self) -> String {
        let mut url = format!(
            "{}://{}:{}@{}:{}/{}",
            self.driver, self.user, self.password, self.host, self.port, self.database
        );
        if self.driver == "postgres" {
            if let Some(mode) = &self.ssl_mode {
                url.push_str(&format!("?sslmode={mode}"));
            }
        }
        url
    }
}

/// Where the death records live and which columns mean what
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// e.g. "records.tb_patient_death"; ignored when custom_query is set
    #[serde(default)]
    pub source_table: String,
    pub fields: FieldMapping,
    /// Watermark column, compared against the last processed death time
    pub filter_column: String,
    /// Optional full SELECT with a {{WATERMARK}} placeholder
    #[serde(default)]
    pub custom_query: Option<String>,
}

/// Source column names for each canonical field. Empty string = unmapped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_id: String,
    pub patient_name: String,
    pub death_time: String,
    pub cause_of_death: String,
    /// Either a birth date column or an age column must be mapped
    #[serde(default)]
    pub birth_date: String,
    #[serde(default)]
    pub age: String,
    /// At least one identifier column must be mapped (masked before push)
    #[serde(default)]
    pub national_health_id: String,
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub sector: String,
    #[serde(default)]
    pub bed: String,
    #[serde(default)]
    pub record_number: String,
}

impl FieldMapping {
    /// Mapped (canonical name, column) pairs, canonical order
    pub fn columns(&self) -> Vec<(&'static str, &str)> {
        [
            ("source_id", self.source_id.as_str()),
            ("patient_name", self.patient_name.as_str()),
            ("death_time", self.death_time.as_str()),
            ("cause_of_death", self.cause_of_death.as_str()),
            ("birth_date", self.birth_date.as_str()),
            ("age", self.age.as_str()),
            ("national_health_id", self.national_health_id.as_str()),
            ("document_id", self.document_id.as_str()),
            ("sector", self.sector.as_str()),
            ("bed", self.bed.as_str()),
            ("record_number", self.record_number.as_str()),
        ]
        .into_iter()
        .filter(|(_, col)| !col.is_empty())
        .collect()
    }
}

/// The central ingestion endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralConfig {
    /// Base URL, e.g. "https://vigil.example.org"
    pub url: String,
    /// Supports ${ENV_VAR} syntax
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub tenant_id: Uuid,
    pub hospital_id: Uuid,
    pub hospital_name: String,
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Offline duration before a health alert fires
    #[serde(default = "default_alert_threshold_secs")]
    pub alert_threshold_secs: u64,
    /// Minimum gap between repeated offline alerts
    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: u64,
    /// How far back to look when no state file exists
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_poll_secs() -> u64 {
    3
}
fn default_state_file() -> String {
    "vigil-agent.state.json".to_string()
}
fn default_alert_threshold_secs() -> u64 {
    600
}
fn default_alert_cooldown_secs() -> u64 {
    1800
}
fn default_lookback_hours() -> i64 {
    24
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw);
        let mut config: AgentConfig =
            serde_yaml::from_str(&substituted).context("parsing agent config")?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.database.port == 0 {
            self.database.port = match self.database.driver.as_str() {
                "mysql" => 3306,
                _ => 5432,
            };
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.agent.poll_interval_secs.max(1))
    }

    pub fn alert_threshold(&self) -> Duration {
        Duration::from_secs(self.agent.alert_threshold_secs)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.agent.alert_cooldown_secs)
    }

    pub fn validate(&self) -> Result<()> {
        match self.database.driver.as_str() {
            "postgres" | "mysql" => {}
            "oracle" => bail!(
                "database.driver 'oracle' is not supported by this agent; \
                 expose the records through a postgres or mysql replica"
            ),
            other => bail!("database.driver must be postgres or mysql, got {other:?}"),
        }
        if self.database.host.is_empty() {
            bail!("database.host is required");
        }
        if self.database.database.is_empty() {
            bail!("database.database is required");
        }
        if self.database.user.is_empty() {
            bail!("database.user is required");
        }

        if self.mapping.source_table.is_empty() && self.mapping.custom_query.is_none() {
            bail!("mapping.source_table or mapping.custom_query is required");
        }
        if self.mapping.filter_column.is_empty() {
            bail!("mapping.filter_column is required");
        }
        for required in ["source_id", "patient_name", "death_time", "cause_of_death"] {
            let mapped = self
                .mapping
                .fields
                .columns()
                .iter()
                .any(|(name, _)| *name == required);
            if !mapped {
                bail!("mapping.fields.{required} is required");
            }
        }
        if self.mapping.fields.birth_date.is_empty() && self.mapping.fields.age.is_empty() {
            bail!("one of mapping.fields.birth_date or mapping.fields.age is required");
        }
        if self.mapping.fields.national_health_id.is_empty()
            && self.mapping.fields.document_id.is_empty()
        {
            bail!(
                "one of mapping.fields.national_health_id or mapping.fields.document_id \
                 is required"
            );
        }

        // Column names flow into generated SQL; keep them to identifiers
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for (name, column) in self.mapping.fields.columns() {
            if !is_valid_identifier(column) {
                bail!("mapping.fields.{name}: invalid column name {column:?}");
            }
            if let Some(previous) = seen.insert(column, name) {
                bail!("mapping.fields.{name} and {previous} map the same column {column:?}");
            }
        }
        if !is_valid_identifier(&self.mapping.filter_column) {
            bail!(
                "mapping.filter_column: invalid column name {:?}",
                self.mapping.filter_column
            );
        }
        if !self.mapping.source_table.is_empty() && !is_valid_identifier(&self.mapping.source_table)
        {
            bail!(
                "mapping.source_table: invalid table name {:?}",
                self.mapping.source_table
            );
        }

        if self.central.url.is_empty() {
            bail!("central.url is required");
        }
        if self.central.api_key.is_empty() {
            bail!("central.api_key is required");
        }
        Ok(())
    }
}

/// Replace `${VAR_NAME}` with the environment value; unset variables are
/// left verbatim so validation reports them in context.
fn substitute_env_vars(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if is_valid_env_name(&after[..end]) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) if !value.is_empty() => out.push_str(&value),
                    _ => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_valid_env_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Identifiers may be schema-qualified ("records.tb_death")
fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !part.starts_with(|c: char| c.is_ascii_digit())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
database:
  driver: postgres
  host: records.hospital.local
  database: records
  user: vigil_ro
  password: "${VIGIL_SOURCE_PASSWORD}"
mapping:
  source_table: records.tb_patient_death
  filter_column: dt_death
  fields:
    source_id: cd_death
    patient_name: nm_patient
    death_time: dt_death
    cause_of_death: ds_cause
    birth_date: dt_birth
    document_id: nr_document
    sector: ds_sector
central:
  url: https://vigil.example.org
  api_key: key-123
agent:
  tenant_id: 018f33e0-0000-7000-8000-000000000001
  hospital_id: 018f33e0-0000-7000-8000-000000000002
  hospital_name: Hospital Geral
"#;

    #[test]
    fn parses_with_defaults() {
        let config = AgentConfig::parse(BASE).unwrap();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.agent.poll_interval_secs, 3);
        assert_eq!(config.agent.alert_threshold_secs, 600);
        assert_eq!(config.agent.lookback_hours, 24);
        assert_eq!(config.mapping.fields.columns().len(), 7);
    }

    #[test]
    fn env_substitution_fills_secrets() {
        std::env::set_var("VIGIL_TEST_SECRET_A", "s3cret");
        let cfg = BASE.replace("${VIGIL_SOURCE_PASSWORD}", "${VIGIL_TEST_SECRET_A}");
        let config = AgentConfig::parse(&cfg).unwrap();
        assert_eq!(config.database.password, "s3cret");
        assert!(config.database.dsn().contains("s3cret"));
    }

    #[test]
    fn unset_env_vars_stay_verbatim() {
        let out = substitute_env_vars("password: ${VIGIL_TEST_UNSET_VAR_XYZ}");
        assert_eq!(out, "password: ${VIGIL_TEST_UNSET_VAR_XYZ}");
    }

    #[test]
    fn oracle_is_rejected_with_guidance() {
        let cfg = BASE.replace("driver: postgres", "driver: oracle");
        let err = AgentConfig::parse(&cfg).unwrap_err().to_string();
        assert!(err.contains("oracle"));
        assert!(err.contains("replica"));
    }

    #[test]
    fn missing_identifier_mapping_fails() {
        let cfg = BASE.replace("    document_id: nr_document\n", "");
        let err = AgentConfig::parse(&cfg).unwrap_err().to_string();
        assert!(err.contains("national_health_id"));
    }

    #[test]
    fn hostile_column_names_fail_validation() {
        let cfg = BASE.replace(
            "cause_of_death: ds_cause",
            "cause_of_death: \"ds_cause; DROP TABLE x\"",
        );
        assert!(AgentConfig::parse(&cfg).is_err());
    }

    #[test]
    fn mysql_defaults_its_port() {
        let cfg = BASE.replace("driver: postgres", "driver: mysql");
        let config = AgentConfig::parse(&cfg).unwrap();
        assert_eq!(config.database.port, 3306);
        assert!(config.database.dsn().starts_with("mysql://"));
    }
}
