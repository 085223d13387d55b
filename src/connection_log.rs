//! Client/device connectivity bookkeeping behind the broker webhooks.
//!
//! [`SqlConnectionLog`] keeps the subscription rows in [`DatabaseService`] and
//! announces every derived device connect or disconnect on the device log
//! topic. [`VoidConnectionLog`] is the variant for deployments without a
//! subscription database.

use crate::bus::{self, Producer};
use crate::db::{DatabaseService, StoreError, Transitions};
use crate::models::{now_rfc3339, DeviceLog};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ConnectionLogError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait ConnectionLog: Send + Sync {
    /// Remembers the session flag a client logged in with.
    async fn record_login(&self, client: &str, clean_session: bool) -> Result<(), ConnectionLogError>;

    /// Client came online; a persistent session gets its subscriptions back.
    async fn record_reconnect(&self, client: &str) -> Result<(), ConnectionLogError>;

    async fn record_subscribe(&self, client: &str, topic: &str, device: &str) -> Result<(), ConnectionLogError>;

    async fn record_unsubscribe(&self, client: &str, topic: &str) -> Result<(), ConnectionLogError>;

    async fn record_disconnect(&self, client: &str) -> Result<(), ConnectionLogError>;
}

pub struct SqlConnectionLog {
    db: Arc<DatabaseService>,
    producer: Arc<dyn Producer>,
    device_log_topic: String,
}

impl SqlConnectionLog {
    pub fn new(db: Arc<DatabaseService>, producer: Arc<dyn Producer>, device_log_topic: impl Into<String>) -> Self {
        Self {
            db,
            producer,
            device_log_topic: device_log_topic.into(),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ConnectionLogError>
    where
        T: Send + 'static,
        F: FnOnce(&DatabaseService) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        Ok(tokio::task::spawn_blocking(move || f(db.as_ref())).await??)
    }

    /// Rows are the source of truth, so a failed announcement is logged and
    /// does not undo the committed change.
    async fn announce(&self, transitions: Transitions) {
        let events = transitions
            .connected
            .into_iter()
            .map(|id| (id, true))
            .chain(transitions.disconnected.into_iter().map(|id| (id, false)));
        for (id, connected) in events {
            debug!(device = %id, connected, "device connection changed");
            let log = DeviceLog {
                id,
                connected,
                time: now_rfc3339(),
            };
            if let Err(e) = bus::send_json(self.producer.as_ref(), &self.device_log_topic, &log.id, &log).await {
                error!(device = %log.id, connected, error = %e, "unable to send device log");
            }
        }
    }
}

#[async_trait]
impl ConnectionLog for SqlConnectionLog {
    async fn record_login(&self, client: &str, clean_session: bool) -> Result<(), ConnectionLogError> {
        let client = client.to_string();
        self.blocking(move |db| db.set_clean_session(&client, clean_session))
            .await
    }

    async fn record_reconnect(&self, client: &str) -> Result<(), ConnectionLogError> {
        let client = client.to_string();
        let transitions = self.blocking(move |db| db.reconnect_client(&client)).await?;
        self.announce(transitions).await;
        Ok(())
    }

    async fn record_subscribe(&self, client: &str, topic: &str, device: &str) -> Result<(), ConnectionLogError> {
        let (client, topic, device) = (client.to_string(), topic.to_string(), device.to_string());
        let transitions = self
            .blocking(move |db| db.store_subscription(&client, &topic, &device))
            .await?;
        self.announce(transitions).await;
        Ok(())
    }

    async fn record_unsubscribe(&self, client: &str, topic: &str) -> Result<(), ConnectionLogError> {
        let (client, topic) = (client.to_string(), topic.to_string());
        let transitions = self
            .blocking(move |db| db.remove_subscription(&client, &topic))
            .await?;
        self.announce(transitions).await;
        Ok(())
    }

    async fn record_disconnect(&self, client: &str) -> Result<(), ConnectionLogError> {
        let client = client.to_string();
        let transitions = self.blocking(move |db| db.disconnect_client(&client)).await?;
        self.announce(transitions).await;
        Ok(())
    }
}

pub struct VoidConnectionLog;

#[async_trait]
impl ConnectionLog for VoidConnectionLog {
    async fn record_login(&self, _client: &str, _clean_session: bool) -> Result<(), ConnectionLogError> {
        Ok(())
    }

    async fn record_reconnect(&self, _client: &str) -> Result<(), ConnectionLogError> {
        Ok(())
    }

    async fn record_subscribe(&self, _client: &str, _topic: &str, _device: &str) -> Result<(), ConnectionLogError> {
        Ok(())
    }

    async fn record_unsubscribe(&self, _client: &str, _topic: &str) -> Result<(), ConnectionLogError> {
        Ok(())
    }

    async fn record_disconnect(&self, _client: &str) -> Result<(), ConnectionLogError> {
        Ok(())
    }
}
