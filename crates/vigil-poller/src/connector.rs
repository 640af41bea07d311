// Source connectors for the hospital records database
//
// Strictly read-only. The generated query aliases every mapped column to
// its canonical name, so row extraction is uniform across drivers and
// custom queries. Connection failures and query failures are distinct:
// the first tears the connector down and triggers reconnect backoff,
// the second keeps the connection and surfaces on the next cycle.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{MySqlPool, PgPool, Row};
use thiserror::Error;

use crate::config::{AgentConfig, MappingConfig};

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The connection itself is gone; reconnect with backoff
    #[error("source connection failed: {0}")]
    Connection(String),

    /// The query failed but the connection survives
    #[error("source query failed: {0}")]
    Query(String),
}

/// One row from the source, already renamed to canonical fields
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub source_id: String,
    pub patient_name: String,
    pub death_time: DateTime<Utc>,
    pub cause_of_death: String,
    pub birth_date: Option<NaiveDate>,
    pub age: Option<i32>,
    pub national_health_id: Option<String>,
    pub document_id: Option<String>,
    pub sector: Option<String>,
    pub bed: Option<String>,
    pub record_number: Option<String>,
}

/// Read-only access to the source table. All methods are safe to call
/// repeatedly; `connect` replaces any previous pool.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self) -> Result<(), ConnectorError>;

    /// Records strictly newer than the watermark, ordered by the filter
    /// column ascending.
    async fn fetch_new_records(
        &self,
        watermark: DateTime<Utc>,
    ) -> Result<Vec<SourceRecord>, ConnectorError>;

    async fn is_connected(&self) -> bool;

    async fn close(&self);
}

/// Pick a connector for the configured driver. Oracle is already
/// rejected at config validation.
pub fn for_config(config: &AgentConfig) -> Box<dyn SourceConnector> {
    match config.database.driver.as_str() {
        "mysql" => Box::new(MySqlConnector::new(config.clone())),
        _ => Box::new(PostgresConnector::new(config.clone())),
    }
}

/// SELECT with canonical aliases and one watermark bind.
///
/// `quote` wraps a possibly schema-qualified identifier in the driver's
/// quoting style; `placeholder` is the driver's first bind marker.
fn build_query(mapping: &MappingConfig, quote: fn(&str) -> String, placeholder: &str) -> String {
    if let Some(custom) = &mapping.custom_query {
        return custom.replace("{{WATERMARK}}", placeholder);
    }

    let columns: Vec<String> = mapping
        .fields
        .columns()
        .into_iter()
        .map(|(name, column)| format!("{} AS {name}", quote(column)))
        .collect();

    format!(
        "SELECT {} FROM {} WHERE {} > {placeholder} ORDER BY {} ASC",
        columns.join(", "),
        quote(&mapping.source_table),
        quote(&mapping.filter_column),
        quote(&mapping.filter_column),
    )
}

fn quote_pg(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}

fn quote_mysql(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| format!("`{part}`"))
        .collect::<Vec<_>>()
        .join(".")
}

/// Optional columns come back as None both when unmapped and when NULL.
macro_rules! opt_column {
    ($row:expr, $mapping:expr, $field:ident, $ty:ty) => {
        if $mapping.fields.$field.is_empty() {
            None
        } else {
            $row.try_get::<Option<$ty>, _>(stringify!($field))
                .map_err(|e| ConnectorError::Query(e.to_string()))?
        }
    };
}

macro_rules! required_column {
    ($row:expr, $field:ident, $ty:ty) => {
        $row.try_get::<$ty, _>(stringify!($field))
            .map_err(|e| ConnectorError::Query(e.to_string()))?
    };
}

// ============================================
// Postgres
// ============================================

pub struct PostgresConnector {
    config: AgentConfig,
    pool: Mutex<Option<PgPool>>,
}

impl PostgresConnector {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(None),
        }
    }

    fn current_pool(&self) -> Result<PgPool, ConnectorError> {
        self.pool
            .lock()
            .clone()
            .ok_or_else(|| ConnectorError::Connection("not connected".into()))
    }
}

#[async_trait]
impl SourceConnector for PostgresConnector {
    async fn connect(&self) -> Result<(), ConnectorError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.config.database.dsn())
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?;
        *self.pool.lock() = Some(pool);
        Ok(())
    }

    async fn fetch_new_records(
        &self,
        watermark: DateTime<Utc>,
    ) -> Result<Vec<SourceRecord>, ConnectorError> {
        let pool = self.current_pool()?;
        let query = build_query(&self.config.mapping, quote_pg, "$1");
        let rows = sqlx::query(&query)
            .bind(watermark)
            .fetch_all(&pool)
            .await
            .map_err(classify_sqlx)?;

        let mapping = &self.config.mapping;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(SourceRecord {
                source_id: required_column!(row, source_id, String),
                patient_name: required_column!(row, patient_name, String),
                death_time: required_column!(row, death_time, DateTime<Utc>),
                cause_of_death: required_column!(row, cause_of_death, String),
                birth_date: opt_column!(row, mapping, birth_date, NaiveDate),
                age: opt_column!(row, mapping, age, i32),
                national_health_id: opt_column!(row, mapping, national_health_id, String),
                document_id: opt_column!(row, mapping, document_id, String),
                sector: opt_column!(row, mapping, sector, String),
                bed: opt_column!(row, mapping, bed, String),
                record_number: opt_column!(row, mapping, record_number, String),
            });
        }
        Ok(records)
    }

    async fn is_connected(&self) -> bool {
        let Ok(pool) = self.current_pool() else {
            return false;
        };
        sqlx::query("SELECT 1").execute(&pool).await.is_ok()
    }

    async fn close(&self) {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.close().await;
        }
    }
}

// ============================================
// MySQL
// ============================================

pub struct MySqlConnector {
    config: AgentConfig,
    pool: Mutex<Option<MySqlPool>>,
}

impl MySqlConnector {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(None),
        }
    }

    fn current_pool(&self) -> Result<MySqlPool, ConnectorError> {
        self.pool
            .lock()
            .clone()
            .ok_or_else(|| ConnectorError::Connection("not connected".into()))
    }
}

#[async_trait]
impl SourceConnector for MySqlConnector {
    async fn connect(&self) -> Result<(), ConnectorError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.config.database.dsn())
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?;
        *self.pool.lock() = Some(pool);
        Ok(())
    }

    async fn fetch_new_records(
        &self,
        watermark: DateTime<Utc>,
    ) -> Result<Vec<SourceRecord>, ConnectorError> {
        let pool = self.current_pool()?;
        let query = build_query(&self.config.mapping, quote_mysql, "?");
        let rows = sqlx::query(&query)
            .bind(watermark)
            .fetch_all(&pool)
            .await
            .map_err(classify_sqlx)?;

        let mapping = &self.config.mapping;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(SourceRecord {
                source_id: required_column!(row, source_id, String),
                patient_name: required_column!(row, patient_name, String),
                death_time: required_column!(row, death_time, DateTime<Utc>),
                cause_of_death: required_column!(row, cause_of_death, String),
                birth_date: opt_column!(row, mapping, birth_date, NaiveDate),
                age: opt_column!(row, mapping, age, i32),
                national_health_id: opt_column!(row, mapping, national_health_id, String),
                document_id: opt_column!(row, mapping, document_id, String),
                sector: opt_column!(row, mapping, sector, String),
                bed: opt_column!(row, mapping, bed, String),
                record_number: opt_column!(row, mapping, record_number, String),
            });
        }
        Ok(records)
    }

    async fn is_connected(&self) -> bool {
        let Ok(pool) = self.current_pool() else {
            return false;
        };
        sqlx::query("SELECT 1").execute(&pool).await.is_ok()
    }

    async fn close(&self) {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.close().await;
        }
    }
}

fn classify_sqlx(e: sqlx::Error) -> ConnectorError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ConnectorError::Connection(e.to_string())
        }
        other => ConnectorError::Query(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldMapping;

    fn mapping() -> MappingConfig {
        MappingConfig {
            source_table: "records.tb_death".into(),
            filter_column: "dt_death".into(),
            custom_query: None,
            fields: FieldMapping {
                source_id: "cd_death".into(),
                patient_name: "nm_patient".into(),
                death_time: "dt_death".into(),
                cause_of_death: "ds_cause".into(),
                document_id: "nr_document".into(),
                sector: "ds_sector".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn generated_query_aliases_and_binds() {
        let query = build_query(&mapping(), quote_pg, "$1");
        assert_eq!(
            query,
            "SELECT \"cd_death\" AS source_id, \"nm_patient\" AS patient_name, \
             \"dt_death\" AS death_time, \"ds_cause\" AS cause_of_death, \
             \"nr_document\" AS document_id, \"ds_sector\" AS sector \
             FROM \"records\".\"tb_death\" WHERE \"dt_death\" > $1 ORDER BY \"dt_death\" ASC"
        );
    }

    #[test]
    fn mysql_uses_backticks_and_question_marks() {
        let query = build_query(&mapping(), quote_mysql, "?");
        assert!(query.contains("`records`.`tb_death`"));
        assert!(query.contains("> ? ORDER BY"));
        assert!(!query.contains('"'));
    }

    #[test]
    fn custom_query_replaces_watermark_placeholder() {
        let mut m = mapping();
        m.custom_query = Some(
            "SELECT x AS source_id FROM v_deaths WHERE updated > {{WATERMARK}}".into(),
        );
        let query = build_query(&m, quote_pg, "$1");
        assert_eq!(
            query,
            "SELECT x AS source_id FROM v_deaths WHERE updated > $1"
        );
    }
}
