use crate::auth::Token;
use crate::models::{Device, DeviceType};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

const REGISTRY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid registry url: {0}")]
    InvalidUrl(String),
    #[error("unexpected registry status {0}")]
    Status(u16),
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Read-only view on devices and device types.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_device(&self, token: &Token, id: &str) -> Result<Device, RegistryError>;

    async fn get_device_type(&self, token: &Token, id: &str) -> Result<DeviceType, RegistryError>;
}

/// Device repository reached over HTTP.
pub struct HttpRegistry {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpRegistry {
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        let base_url =
            Url::parse(base_url).map_err(|e| RegistryError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RegistryError::InvalidUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder().timeout(REGISTRY_TIMEOUT).build()?;
        Ok(Self { http, base_url })
    }

    fn resource_url(&self, collection: &str, id: &str) -> Result<Url, RegistryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RegistryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(collection)
            .push(id);
        Ok(url)
    }

    async fn fetch<T: DeserializeOwned>(&self, token: &Token, url: Url) -> Result<T, RegistryError> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::AccessDenied),
            status if status.is_success() => Ok(response.json::<T>().await?),
            status => Err(RegistryError::Status(status.as_u16())),
        }
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn get_device(&self, token: &Token, id: &str) -> Result<Device, RegistryError> {
        let url = self.resource_url("devices", id)?;
        self.fetch(token, url).await
    }

    async fn get_device_type(&self, token: &Token, id: &str) -> Result<DeviceType, RegistryError> {
        let url = self.resource_url("device-types", id)?;
        self.fetch(token, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_ids_in_path() {
        let registry = HttpRegistry::new("http://repo:8080/api/").unwrap();
        let url = registry
            .resource_url("devices", "urn:infai:ses:device:1/2")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://repo:8080/api/devices/urn:infai:ses:device:1%2F2"
        );
    }

    #[test]
    fn rejects_non_base_url() {
        assert!(HttpRegistry::new("mailto:someone").is_err());
    }
}
