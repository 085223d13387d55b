#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use mqtt_device_bridge::auth::{Auth, AuthError, Token};
use mqtt_device_bridge::bus::{BusError, Producer};
use mqtt_device_bridge::models::{Device, DeviceType, Service};
use mqtt_device_bridge::mqtt_service::{MqttError, Publisher};
use mqtt_device_bridge::notify::{Notification, Notifier, NotifyError};
use mqtt_device_bridge::registry::{Registry, RegistryError};
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Mutex;
use tokio::net::TcpListener;

pub const DEVICE_ID: &str = "urn:infai:ses:device:6bd07b75-d7cc-4a1a-88db-ac93f61aa7b3";
pub const SHORT_DEVICE_ID: &str = "a9B7ddfMShqI26yT9hqnsw";
pub const OTHER_DEVICE_ID: &str = "urn:infai:ses:device:6bd07b75-d7cc-4a1a-88db-ac93f61aa7b4";
pub const OTHER_SHORT_DEVICE_ID: &str = "a9B7ddfMShqI26yT9hqntA";
/// Decodes fine but is not registered.
pub const UNKNOWN_SHORT_ID: &str = "a9B7ddfMShqI26yT9hqntQ";
pub const DEVICE_TYPE_ID: &str = "urn:infai:ses:device-type:tasmota";
pub const SENSOR_SERVICE_ID: &str = "urn:infai:ses:service:sensor";
pub const SYSTEM_CLIENT: &str = "connector";
pub const PANIC_USER: &str = "panic";

pub fn service(id: &str, local_id: &str) -> Service {
    Service {
        id: id.to_string(),
        local_id: local_id.to_string(),
        name: String::new(),
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    devices: HashMap<String, Device>,
    device_types: HashMap<String, DeviceType>,
}

impl FakeRegistry {
    /// One tasmota style device with a sensor and two power services.
    pub fn with_device() -> Self {
        let mut registry = Self::default();
        registry.device_types.insert(
            DEVICE_TYPE_ID.to_string(),
            DeviceType {
                id: DEVICE_TYPE_ID.to_string(),
                name: "tasmota".to_string(),
                services: vec![
                    service(SENSOR_SERVICE_ID, "tele/SENSOR"),
                    service("urn:infai:ses:service:poweron", "poweron"),
                    service("urn:infai:ses:service:void-poweron", "void/poweron"),
                ],
            },
        );
        registry.devices.insert(
            DEVICE_ID.to_string(),
            Device {
                id: DEVICE_ID.to_string(),
                local_id: "lamp-1".to_string(),
                name: "lamp".to_string(),
                device_type_id: DEVICE_TYPE_ID.to_string(),
            },
        );
        registry
    }

    /// Two registered devices of the same type.
    pub fn with_two_devices() -> Self {
        let mut registry = Self::with_device();
        registry.devices.insert(
            OTHER_DEVICE_ID.to_string(),
            Device {
                id: OTHER_DEVICE_ID.to_string(),
                local_id: "lamp-2".to_string(),
                name: "second lamp".to_string(),
                device_type_id: DEVICE_TYPE_ID.to_string(),
            },
        );
        registry
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn get_device(&self, _token: &Token, id: &str) -> Result<Device, RegistryError> {
        self.devices.get(id).cloned().ok_or(RegistryError::NotFound)
    }

    async fn get_device_type(&self, _token: &Token, id: &str) -> Result<DeviceType, RegistryError> {
        self.device_types
            .get(id)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }
}

/// Accepts every user whose password is `secret`.
pub struct FakeAuth;

#[async_trait]
impl Auth for FakeAuth {
    async fn exchange_credential_for_token(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<Token, AuthError> {
        match password {
            Some("secret") | None => Ok(Token::new(format!("token-{username}"))),
            Some(_) => Err(AuthError::AccessDenied),
        }
    }

    async fn get_cached_user_token(&self, username: &str) -> Result<Token, AuthError> {
        if username == PANIC_USER {
            panic!("token cache poisoned");
        }
        Ok(Token::new(format!("token-{username}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

impl SentMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

#[derive(Default)]
pub struct RecordingProducer {
    sent: Mutex<Vec<SentMessage>>,
    failing_topic: Option<String>,
}

impl RecordingProducer {
    /// Answers every send to `topic` with a 503 and records nothing for it.
    pub fn failing_on(topic: &str) -> Self {
        Self {
            failing_topic: Some(topic.to_string()),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, topic: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }
}

#[async_trait]
impl Producer for RecordingProducer {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        if self.failing_topic.as_deref() == Some(topic) {
            return Err(BusError::Status(503));
        }
        self.sent.lock().unwrap().push(SentMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, Vec<u8>, u8)>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<(String, Vec<u8>, u8)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), MqttError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec(), qos));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Serves `router` on a loopback port and returns its base url.
pub async fn spawn_server(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, router).into_future());
    format!("http://{addr}")
}
