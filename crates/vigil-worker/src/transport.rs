// Channel transports - the HTTP edge where queue items leave the system
//
// Each transport speaks to one provider API over reqwest. 4xx responses
// are reported as permanent, everything else as transient; the
// dispatcher walks the same retry schedule either way, the distinction
// only shapes the dead-letter error text.

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use vigil_core::{Channel, QueueItem};

/// SMS bodies are truncated to a single segment.
const SMS_MAX_LEN: usize = 160;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Provider or network failure; the same payload may succeed later
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The provider rejected the message itself
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// One delivery provider for one channel.
#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> Channel;

    async fn deliver(&self, item: &QueueItem) -> Result<(), DeliveryError>;
}

/// Provider endpoint settings, one per configured channel
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub api_key: String,
    /// Sender identity: from-address for email, short code for SMS
    pub sender: String,
}

impl TransportConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            sender: sender.into(),
        }
    }

    /// Provider settings for one channel from the environment, e.g.
    /// EMAIL_API_URL / EMAIL_API_KEY / EMAIL_SENDER. A channel with no
    /// URL configured is disabled.
    pub fn from_env(channel: Channel) -> Option<Self> {
        let prefix = channel.as_str().to_uppercase();
        let base_url = std::env::var(format!("{prefix}_API_URL")).ok()?;
        let api_key = std::env::var(format!("{prefix}_API_KEY")).unwrap_or_default();
        let sender = std::env::var(format!("{prefix}_SENDER")).unwrap_or_default();
        Some(Self::new(base_url, api_key, sender))
    }
}

/// Build the channel-appropriate transport over a shared HTTP client.
pub fn for_channel(
    channel: Channel,
    client: reqwest::Client,
    config: TransportConfig,
) -> std::sync::Arc<dyn Transport> {
    match channel {
        Channel::Email => std::sync::Arc::new(HttpEmailTransport::new(client, config)),
        Channel::Sms => std::sync::Arc::new(HttpSmsTransport::new(client, config)),
        Channel::Push => std::sync::Arc::new(HttpPushTransport::new(client, config)),
    }
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    body: &serde_json::Value,
) -> Result<(), DeliveryError> {
    let response = client
        .post(url)
        .bearer_auth(api_key)
        .json(body)
        .send()
        .await
        .map_err(|e| DeliveryError::Transient(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let detail = response.text().await.unwrap_or_default();
    let message = format!("{status}: {detail}");
    if status.is_client_error() {
        Err(DeliveryError::Permanent(message))
    } else {
        Err(DeliveryError::Transient(message))
    }
}

fn alert_line(item: &QueueItem) -> String {
    let payload = &item.payload;
    let sector = payload.sector.as_deref().unwrap_or("setor nao informado");
    format!(
        "Obito em {} ({}), prioridade {}, janela restante {}",
        payload.hospital_name, sector, payload.priority_score, payload.time_remaining
    )
}

// ============================================
// Email
// ============================================

pub struct HttpEmailTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpEmailTransport {
    pub fn new(client: reqwest::Client, config: TransportConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Transport for HttpEmailTransport {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn deliver(&self, item: &QueueItem) -> Result<(), DeliveryError> {
        let subject = format!(
            "Alerta de obito - {} (prioridade {})",
            item.payload.hospital_name, item.payload.priority_score
        );
        let body = json!({
            "from": self.config.sender,
            "to": item.recipient,
            "subject": subject,
            "text": format!(
                "{}\nFalecimento: {}\nAcesse o painel para assumir a ocorrencia {}.",
                alert_line(item),
                item.payload.death_time.to_rfc3339(),
                item.payload.occurrence_id,
            ),
        });
        let url = format!("{}/messages", self.config.base_url);
        post_json(&self.client, &url, &self.config.api_key, &body).await
    }
}

// ============================================
// SMS
// ============================================

pub struct HttpSmsTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpSmsTransport {
    pub fn new(client: reqwest::Client, config: TransportConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Transport for HttpSmsTransport {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn deliver(&self, item: &QueueItem) -> Result<(), DeliveryError> {
        let mut text = alert_line(item);
        if text.len() > SMS_MAX_LEN {
            let mut end = SMS_MAX_LEN;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        let body = json!({
            "from": self.config.sender,
            "to": item.recipient,
            "body": text,
        });
        let url = format!("{}/sms", self.config.base_url);
        post_json(&self.client, &url, &self.config.api_key, &body).await
    }
}

// ============================================
// Push
// ============================================

pub struct HttpPushTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpPushTransport {
    pub fn new(client: reqwest::Client, config: TransportConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Transport for HttpPushTransport {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn deliver(&self, item: &QueueItem) -> Result<(), DeliveryError> {
        let body = json!({
            "token": item.recipient,
            "title": format!("Alerta de obito - {}", item.payload.hospital_name),
            "body": alert_line(item),
            "data": {
                "occurrence_id": item.payload.occurrence_id,
                "priority_score": item.payload.priority_score,
            },
        });
        let url = format!("{}/push", self.config.base_url);
        post_json(&self.client, &url, &self.config.api_key, &body).await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    /// Scripted transport for dispatcher tests: pops one outcome per
    /// delivery and records every item it saw.
    pub struct FakeTransport {
        channel: Channel,
        outcomes: Mutex<VecDeque<Result<(), DeliveryError>>>,
        pub delivered: Mutex<Vec<QueueItem>>,
    }

    impl FakeTransport {
        pub fn new(channel: Channel) -> Self {
            Self {
                channel,
                outcomes: Mutex::new(VecDeque::new()),
                delivered: Mutex::new(Vec::new()),
            }
        }

        pub fn script(&self, outcome: Result<(), DeliveryError>) {
            self.outcomes.lock().push_back(outcome);
        }

        pub fn script_failures(&self, n: usize) {
            for _ in 0..n {
                self.script(Err(DeliveryError::Transient("provider down".into())));
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn deliver(&self, item: &QueueItem) -> Result<(), DeliveryError> {
            self.delivered.lock().push(item.clone());
            self.outcomes.lock().pop_front().unwrap_or(Ok(()))
        }
    }
}
