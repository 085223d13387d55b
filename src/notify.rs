use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification rejected with status {0}")]
    Status(u16),
    #[error("notification request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    pub title: String,
    pub message: String,
}

/// Operator facing notices, e.g. about ignored publishes.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

pub struct HttpNotifier {
    http: reqwest::Client,
    url: String,
    ignore_duplicates_within_s: u64,
}

impl HttpNotifier {
    pub fn new(base_url: &str, ignore_duplicates_within_s: u64) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder().timeout(NOTIFY_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: format!("{}/notifications", base_url.trim_end_matches('/')),
            ignore_duplicates_within_s,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.url)
            .query(&[(
                "ignore_duplicates_within_seconds",
                self.ignore_duplicates_within_s.to_string(),
            )])
            .json(notification)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}
