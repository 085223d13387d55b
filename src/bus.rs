use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

const BUS_TIMEOUT: Duration = Duration::from_secs(10);
const BUS_RETRIES: usize = 3;
const CONTENT_TYPE: &str = "application/vnd.kafka.binary.v2+json";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid bus url: {0}")]
    InvalidUrl(String),
    #[error("bus rejected message with status {0}")]
    Status(u16),
    #[error("bus request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unable to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BusError {
    fn is_transient(&self) -> bool {
        match self {
            BusError::Transport(_) => true,
            BusError::Status(status) => *status >= 500 || *status == 429,
            BusError::InvalidUrl(_) | BusError::Encode(_) => false,
        }
    }
}

/// Message bus producer.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError>;
}

/// Serializes `message` as JSON and sends it.
pub async fn send_json<T: Serialize + Sync>(
    producer: &dyn Producer,
    topic: &str,
    key: &str,
    message: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(message)?;
    producer.send(topic, key, &payload).await
}

/// Bus topic carrying the events of one service.
pub fn service_topic(service_id: &str) -> String {
    service_id.replace([':', '#'], "_")
}

#[derive(Serialize)]
struct Record {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct Records {
    records: Vec<Record>,
}

/// Producer talking to a Kafka REST proxy (binary embedded format, v2).
pub struct RestProducer {
    http: reqwest::Client,
    base_url: Url,
}

impl RestProducer {
    pub fn new(base_url: &str) -> Result<Self, BusError> {
        let base_url =
            Url::parse(base_url).map_err(|e| BusError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(BusError::InvalidUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder().timeout(BUS_TIMEOUT).build()?;
        Ok(Self { http, base_url })
    }

    fn topic_url(&self, topic: &str) -> Result<Url, BusError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BusError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("topics")
            .push(topic);
        Ok(url)
    }

    async fn post(&self, url: &Url, body: &Records) -> Result<(), BusError> {
        let response = self
            .http
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .json(body)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::TOO_MANY_REQUESTS => Err(BusError::Status(429)),
            status => Err(BusError::Status(status.as_u16())),
        }
    }
}

#[async_trait]
impl Producer for RestProducer {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        let url = self.topic_url(topic)?;
        let body = Records {
            records: vec![Record {
                key: STANDARD.encode(key),
                value: STANDARD.encode(payload),
            }],
        };
        let strategy = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(BUS_RETRIES);
        RetryIf::spawn(
            strategy,
            || self.post(&url, &body),
            |e: &BusError| {
                let retry = e.is_transient();
                if retry {
                    warn!(topic, error = %e, "retrying bus send");
                }
                retry
            },
        )
        .await
    }
}
