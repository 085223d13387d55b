use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Password,
    /// The broker validated a client certificate; only a token exchange is done.
    Certificate,
}

impl FromStr for AuthMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "password" => Ok(AuthMethod::Password),
            "certificate" => Ok(AuthMethod::Certificate),
            other => Err(ConfigError::ParsingError(format!(
                "MQTT_AUTH_METHOD must be 'password' or 'certificate', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub webhook_port: u16,
    pub command_port: u16,
    pub debug: bool,

    pub auth_client_id: String,
    pub auth_client_secret: String,
    pub auth_endpoint: String,
    pub auth_expiration_time_buffer_s: u64,
    pub mqtt_auth_method: AuthMethod,

    pub device_repo_url: String,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_qos: u8,
    pub mqtt_max_retries: i32,
    pub mqtt_retry_interval_ms: u64,
    pub actuator_topic_pattern: String,

    /// `None` when subscriptions are not tracked.
    pub subscription_db_path: Option<String>,
    pub device_log_topic: String,
    pub bus_url: String,

    pub command_worker_count: usize,

    pub notification_url: Option<String>,
    pub notifications_ignore_duplicates_within_s: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingOrInvalid(key.to_string()))
}

fn or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parsed<F, T>(lookup: &F, key: &str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    or_default(lookup, key, default)
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid value", key)))
}

/// `-` and the empty string switch an optional component off.
fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.is_empty() && v != "-")
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if self.mqtt_qos > 2 {
            return Err(ConfigError::ParsingError(
                "MQTT_QOS must be 0, 1 or 2".to_string(),
            ));
        }
        if self.command_worker_count == 0 {
            return Err(ConfigError::ParsingError(
                "COMMAND_WORKER_COUNT must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            webhook_port: parsed(&lookup, "WEBHOOK_PORT", "8080")?,
            command_port: parsed(&lookup, "COMMAND_PORT", "8081")?,
            debug: parsed(&lookup, "DEBUG", "false")?,

            auth_client_id: required(&lookup, "AUTH_CLIENT_ID")?,
            auth_client_secret: lookup("AUTH_CLIENT_SECRET").unwrap_or_default(),
            auth_endpoint: required(&lookup, "AUTH_ENDPOINT")?,
            auth_expiration_time_buffer_s: parsed(&lookup, "AUTH_EXPIRATION_TIME_BUFFER", "2")?,
            mqtt_auth_method: or_default(&lookup, "MQTT_AUTH_METHOD", "password").parse()?,

            device_repo_url: required(&lookup, "DEVICE_REPO_URL")?,

            mqtt_host: required(&lookup, "MQTT_HOST")?,
            mqtt_port: parsed(&lookup, "MQTT_PORT", "1883")?,
            mqtt_qos: parsed(&lookup, "MQTT_QOS", "2")?,
            mqtt_max_retries: parsed(&lookup, "MQTT_MAX_RETRIES", "-1")?,
            mqtt_retry_interval_ms: parsed(&lookup, "MQTT_RETRY_INTERVAL_MS", "5000")?,
            actuator_topic_pattern: or_default(
                &lookup,
                "ACTUATOR_TOPIC_PATTERN",
                "{{.DeviceId}}/cmnd/{{.LocalServiceId}}",
            ),

            // Only "-" turns subscription tracking off.
            subscription_db_path: Some(or_default(&lookup, "SUBSCRIPTION_DB_PATH", "subscriptions.db"))
                .filter(|path| path != "-"),
            device_log_topic: or_default(&lookup, "DEVICE_LOG_TOPIC", "device_log"),
            bus_url: required(&lookup, "BUS_URL")?,

            command_worker_count: parsed(&lookup, "COMMAND_WORKER_COUNT", "10")?,

            notification_url: optional(&lookup, "NOTIFICATION_URL"),
            notifications_ignore_duplicates_within_s: parsed(
                &lookup,
                "NOTIFICATIONS_IGNORE_DUPLICATES_WITHIN_S",
                "3600",
            )?,
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }
}
