use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_id: String,
    /// Negative means unlimited.
    pub mqtt_max_retries: i32,
    pub mqtt_retry_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("mqtt client is not connected")]
    NotConnected,
    #[error("invalid qos {0}")]
    InvalidQos(u8),
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Delivers command payloads onto the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), MqttError>;
}

pub fn to_qos(qos: u8) -> Result<QoS, MqttError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttError::InvalidQos(other)),
    }
}

pub struct MqttService {
    client_state: Mutex<ClientState>,
    client: Mutex<Option<AsyncClient>>,
    config: MqttConfig,
}

impl MqttService {
    pub fn new(config: MqttConfig) -> Arc<Self> {
        Arc::new(Self {
            client_state: Mutex::new(ClientState::Disconnected),
            client: Mutex::new(None),
            config,
        })
    }

    pub async fn state(&self) -> ClientState {
        self.client_state.lock().await.clone()
    }

    async fn set_state(&self, state: ClientState) {
        *self.client_state.lock().await = state;
    }

    /// Connects and keeps the connection alive until `shutdown` flips to true
    /// or the retry budget is used up.
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            host = %self.config.mqtt_host,
            port = self.config.mqtt_port,
            client_id = %self.config.mqtt_client_id,
            "starting mqtt service"
        );

        let initial_retry_interval = Duration::from_millis(self.config.mqtt_retry_interval_ms);
        let max_retries = self.config.mqtt_max_retries;
        let mut retry_interval = initial_retry_interval;
        let mut retries = 0;

        loop {
            if max_retries >= 0 && retries > max_retries {
                error!(max_retries, "maximum number of mqtt retries reached, stopping");
                self.set_state(ClientState::Error("retries exhausted".to_string()))
                    .await;
                break;
            }

            let mut mqtt_options = MqttOptions::new(
                &self.config.mqtt_client_id,
                &self.config.mqtt_host,
                self.config.mqtt_port,
            );
            mqtt_options.set_keep_alive(Duration::from_secs(10));
            mqtt_options.set_clean_session(true);
            if !self.config.mqtt_username.is_empty() {
                mqtt_options.set_credentials(&self.config.mqtt_username, &self.config.mqtt_password);
            }

            let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);
            *self.client.lock().await = Some(client.clone());
            self.set_state(ClientState::Connecting).await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("stopping mqtt service");
                        if let Err(e) = client.try_disconnect() {
                            debug!(error = %e, "mqtt disconnect failed");
                        }
                        *self.client.lock().await = None;
                        self.set_state(ClientState::Disconnected).await;
                        return;
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("connected to mqtt broker");
                            self.set_state(ClientState::Connected).await;
                            retry_interval = initial_retry_interval;
                            retries = 0;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            warn!(topic = %publish.topic, "unexpected incoming publish");
                        }
                        Ok(event) => debug!(?event, "mqtt event"),
                        Err(e) => {
                            error!(error = %e, "mqtt connection error");
                            self.set_state(ClientState::Error(e.to_string())).await;
                            break;
                        }
                    }
                }
            }

            *self.client.lock().await = None;
            warn!(?retry_interval, "lost connection to mqtt broker, retrying");
            retries += 1;
            tokio::select! {
                _ = shutdown.changed() => {
                    self.set_state(ClientState::Disconnected).await;
                    return;
                }
                _ = sleep(retry_interval) => {}
            }
            retry_interval = (retry_interval * 2).min(MAX_RETRY_INTERVAL);
        }
    }
}

#[async_trait]
impl Publisher for MqttService {
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), MqttError> {
        let qos = to_qos(qos)?;
        // Held across the publish so calls reach the client one at a time.
        let client = self.client.lock().await;
        if *self.client_state.lock().await != ClientState::Connected {
            return Err(MqttError::NotConnected);
        }
        let client = client.as_ref().ok_or(MqttError::NotConnected)?;
        client.try_publish(topic, qos, false, payload.to_vec())?;
        debug!(topic, bytes = payload.len(), "published command");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MqttConfig {
        MqttConfig {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            mqtt_client_id: "test".to_string(),
            mqtt_max_retries: 0,
            mqtt_retry_interval_ms: 100,
        }
    }

    #[test]
    fn qos_levels() {
        assert_eq!(to_qos(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(to_qos(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(to_qos(3), Err(MqttError::InvalidQos(3))));
    }

    #[tokio::test]
    async fn publish_before_connect_fails() {
        let service = MqttService::new(config());
        assert_eq!(service.state().await, ClientState::Disconnected);
        let err = service.publish("a/b", b"x", 1).await.unwrap_err();
        assert!(matches!(err, MqttError::NotConnected));
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let service = MqttService::new(config());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(service.clone().start(rx));
        let _ = tx.send(true);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(service.state().await, ClientState::Connected);
    }
}
