// HTTP push sink - the remote side of the EventSink seam
//
// Publishes canonical events to the central ingestion endpoint with the
// per-hospital API key. 400 and 401 mean the payload or the key is
// wrong; retrying those would loop forever, so they surface as Rejected
// and the poller skips the record.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use vigil_core::{DeathEvent, EventSink, SinkError};

use crate::config::CentralConfig;
use crate::poller::PollerStatus;

const USER_AGENT: &str = concat!("vigil-agent/", env!("CARGO_PKG_VERSION"));

pub struct HttpSink {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpSink {
    pub fn new(config: &CentralConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), SinkError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("X-API-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        let message = format!("{status}: {detail}");
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => Err(SinkError::Rejected(message)),
            _ => Err(SinkError::Unavailable(message)),
        }
    }

    /// Report the agent's health snapshot alongside the event stream.
    /// Failures are the caller's to ignore; status is best-effort.
    pub async fn report_status(&self, status: &PollerStatus) -> Result<(), SinkError> {
        self.post("/v1/agents/status", status).await
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn publish_event(&self, event: &DeathEvent) -> Result<(), SinkError> {
        self.post("/v1/events", event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> CentralConfig {
        CentralConfig {
            url: url.to_string(),
            api_key: "agent-key-1".into(),
            timeout_secs: 5,
        }
    }

    fn event() -> DeathEvent {
        DeathEvent {
            source_id: "OB-1".into(),
            tenant_id: Uuid::now_v7(),
            hospital_id: Uuid::now_v7(),
            hospital_name: Some("HGF".into()),
            death_time: Utc::now(),
            cause_of_death: "infarto".into(),
            age: 70,
            masked_patient_id: "***901".into(),
            sector: None,
            bed: None,
            record_number: None,
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publishes_with_api_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/events"))
            .and(header("X-API-Key", "agent-key-1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpSink::new(&config(&server.uri())).unwrap();
        sink.publish_event(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn auth_and_schema_failures_are_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/events"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/events"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad age"))
            .mount(&server)
            .await;

        let sink = HttpSink::new(&config(&server.uri())).unwrap();

        let unauthorized = sink.publish_event(&event()).await.unwrap_err();
        assert!(!unauthorized.is_retryable());

        let invalid = sink.publish_event(&event()).await.unwrap_err();
        assert!(!invalid.is_retryable());
        assert!(invalid.to_string().contains("bad age"));
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/events"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = HttpSink::new(&config(&server.uri())).unwrap();
        let err = sink.publish_event(&event()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
