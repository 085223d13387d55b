use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub local_id: String,
    #[serde(default)]
    pub name: String,
    pub device_type_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    /// Topic fragment identifying the service, unique within its device type.
    pub local_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub services: Vec<Service>,
}

/// Row of `ClientDeviceSubscription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client: String,
    pub topic: String,
    pub device: String,
    pub inactive: bool,
}

/// Row of `CleanSession`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanSession {
    pub client: String,
    pub clean_session: bool,
}

/// Backend command addressed to a device service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub device_id: String,
    #[serde(default)]
    pub device_local_id: String,
    #[serde(default)]
    pub service_id: String,
    pub service_local_id: String,
    pub payload: String,
    #[serde(default)]
    pub qos: Option<u8>,
}

/// Connect/disconnect notice published to the device log topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLog {
    pub id: String,
    pub connected: bool,
    pub time: String,
}

/// Accepted device publish forwarded to the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub device_id: String,
    pub local_device_id: String,
    pub service_id: String,
    pub local_service_id: String,
    pub payload: String,
    pub qos: u8,
    pub time: String,
}

/// Current UTC time as RFC 3339.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
