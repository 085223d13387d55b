//! Maps MQTT topics onto registered devices and services, and back.
//!
//! A topic references a device by embedding its long (`urn:infai:ses:device:<uuid>`)
//! or short (22 character base64) identifier as one of its `/` separated segments.
//! Services are matched by checking whether their local id occurs anywhere in the
//! topic; the longest match wins among the services of one device. More than one
//! plausible device is never guessed at.

use crate::auth::Token;
use crate::models::{Device, Service};
use crate::registry::{Registry, RegistryError};
use crate::shortid::{self, ShortIdError, DEVICE_PREFIX, SHORT_ID_LEN};
use regex::{Captures, Regex};
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::debug;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*\.(\w+)\s*\}\}").expect("placeholder pattern compiles"));

#[derive(Debug, Error)]
pub enum ParseError {
    /// No segment of the topic looks like a device id.
    #[error("no device id candidate found")]
    NoDeviceIdCandidate,
    #[error("no device match found")]
    NoDeviceMatch,
    #[error("multiple matching devices found")]
    MultipleMatchingDevices,
    /// The device is known, none of its services occurs in the topic.
    #[error("no service match found")]
    NoServiceMatch(Box<Device>),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error)]
pub enum CreateError {
    #[error(transparent)]
    ShortId(#[from] ShortIdError),
    #[error("unknown topic placeholder {0:?}")]
    UnknownPlaceholder(String),
}

/// A device found in a topic together with its services that occur in it,
/// longest local id first.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub device: Device,
    pub services: Vec<Service>,
}

impl Candidate {
    fn longest_match(&self) -> usize {
        self.services.first().map_or(0, |s| s.local_id.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub device: Device,
    pub service: Service,
}

pub struct TopicResolver {
    registry: Arc<dyn Registry>,
    default_pattern: String,
}

impl TopicResolver {
    pub fn new(registry: Arc<dyn Registry>, default_pattern: impl Into<String>) -> Self {
        Self {
            registry,
            default_pattern: default_pattern.into(),
        }
    }

    /// Resolves `topic` to exactly one device and its best matching service.
    pub async fn parse(&self, token: &Token, topic: &str) -> Result<Resolved, ParseError> {
        let mut candidates = self.candidates(token, topic).await?;
        if candidates.len() > 1 {
            debug!(
                topic,
                devices = ?candidates.iter().map(|c| c.device.id.as_str()).collect::<Vec<_>>(),
                "ambiguous topic"
            );
            return Err(ParseError::MultipleMatchingDevices);
        }
        let Candidate { device, services } = candidates.pop().ok_or(ParseError::NoDeviceMatch)?;
        match services.into_iter().next() {
            Some(service) => Ok(Resolved { device, service }),
            None => Err(ParseError::NoServiceMatch(Box::new(device))),
        }
    }

    /// All devices referenced by `topic`, most specific service match first.
    pub async fn candidates(&self, token: &Token, topic: &str) -> Result<Vec<Candidate>, ParseError> {
        let ids = device_id_candidates(topic);
        if ids.is_empty() {
            return Err(ParseError::NoDeviceIdCandidate);
        }

        let mut candidates: Vec<Candidate> = Vec::with_capacity(ids.len());
        for id in ids {
            let device = match self.registry.get_device(token, &id).await {
                Ok(device) => device,
                Err(RegistryError::NotFound | RegistryError::AccessDenied) => continue,
                Err(e) => return Err(e.into()),
            };
            if candidates.iter().any(|c| c.device.id == device.id) {
                continue;
            }
            let services = self.matching_services(token, &device, topic).await?;
            candidates.push(Candidate { device, services });
        }
        if candidates.is_empty() {
            return Err(ParseError::NoDeviceMatch);
        }

        rank_candidates(&mut candidates);
        Ok(candidates)
    }

    async fn matching_services(
        &self,
        token: &Token,
        device: &Device,
        topic: &str,
    ) -> Result<Vec<Service>, RegistryError> {
        let device_type = self
            .registry
            .get_device_type(token, &device.device_type_id)
            .await?;
        let mut services: Vec<Service> = device_type
            .services
            .into_iter()
            .filter(|s| !s.local_id.is_empty() && topic.contains(&s.local_id))
            .collect();
        services.sort_by(|a, b| b.local_id.len().cmp(&a.local_id.len()));
        Ok(services)
    }

    /// Renders the topic a command for `local_service_id` is published on.
    ///
    /// A local service id carrying `{{.DeviceId}}` or `{{.ShortDeviceId}}` is a
    /// topic template of its own; anything else is placed into the default pattern.
    pub fn create(&self, device_id: &str, local_service_id: &str) -> Result<String, CreateError> {
        let short_device_id = shortid::shorten(device_id)?;
        let topic = render(
            local_service_id,
            &[("DeviceId", device_id), ("ShortDeviceId", &short_device_id)],
        )?;
        if topic != local_service_id {
            return Ok(topic);
        }
        render(
            &self.default_pattern,
            &[
                ("DeviceId", device_id),
                ("ShortDeviceId", &short_device_id),
                ("LocalServiceId", local_service_id),
            ],
        )
    }
}

/// Orders by number of matching services, then by length of the best match.
fn rank_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.services
            .len()
            .cmp(&a.services.len())
            .then_with(|| b.longest_match().cmp(&a.longest_match()))
    });
}

/// Long device ids found in `topic`, short ids already lengthened. Short ids
/// that fail to decode are dropped.
pub fn device_id_candidates(topic: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for segment in topic.split('/') {
        let id = if is_long_device_id(segment) {
            segment.to_string()
        } else if is_short_id(segment) {
            match shortid::ensure_long_device_id(segment) {
                Ok(id) => id,
                Err(e) => {
                    debug!(segment, error = %e, "dropping short id candidate");
                    continue;
                }
            }
        } else {
            continue;
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_long_device_id(segment: &str) -> bool {
    segment
        .strip_prefix(DEVICE_PREFIX)
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(is_id_char))
}

fn is_short_id(segment: &str) -> bool {
    segment.len() == SHORT_ID_LEN && segment.chars().all(is_id_char)
}

fn render(template: &str, vars: &[(&str, &str)]) -> Result<String, CreateError> {
    let lookup = |key: &str| vars.iter().find(|(name, _)| *name == key).map(|(_, v)| *v);
    if let Some(unknown) = PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .find(|key| lookup(key).is_none())
    {
        return Err(CreateError::UnknownPlaceholder(unknown));
    }
    Ok(PLACEHOLDER
        .replace_all(template, |caps: &Captures| lookup(&caps[1]).unwrap_or_default().to_string())
        .into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceType;
    use async_trait::async_trait;
    use std::collections::HashMap;

    const SHORT: &str = "a9B7ddfMShqI26yT9hqnsw";
    const LONG: &str = "urn:infai:ses:device:6bd07b75-d7cc-4a1a-88db-ac93f61aa7b3";
    const SHORT_2: &str = "a9B7ddfMShqI26yT9hqntA";
    const LONG_2: &str = "urn:infai:ses:device:6bd07b75-d7cc-4a1a-88db-ac93f61aa7b4";
    const UNKNOWN_SHORT: &str = "a9B7ddfMShqI26yT9hqntQ";
    const UNKNOWN_LONG: &str = "urn:infai:ses:device:6bd07b75-d7cc-4a1a-88db-ac93f61aa7bu";
    const FORBIDDEN_LONG: &str = "urn:infai:ses:device:9a3c2b10-0f0e-4d5c-8b7a-112233445566";
    const BROKEN_LONG: &str = "urn:infai:ses:device:broken";

    struct StaticRegistry {
        devices: HashMap<String, Device>,
        device_types: HashMap<String, DeviceType>,
    }

    #[async_trait]
    impl Registry for StaticRegistry {
        async fn get_device(&self, _token: &Token, id: &str) -> Result<Device, RegistryError> {
            match id {
                FORBIDDEN_LONG => Err(RegistryError::AccessDenied),
                BROKEN_LONG => Err(RegistryError::Status(500)),
                _ => self.devices.get(id).cloned().ok_or(RegistryError::NotFound),
            }
        }

        async fn get_device_type(&self, _token: &Token, id: &str) -> Result<DeviceType, RegistryError> {
            self.device_types.get(id).cloned().ok_or(RegistryError::NotFound)
        }
    }

    fn service(local_id: &str) -> Service {
        Service {
            id: format!("urn:infai:ses:service:{}", local_id.replace('/', "-")),
            local_id: local_id.to_string(),
            name: local_id.to_string(),
        }
    }

    fn device(id: &str, device_type_id: &str) -> Device {
        Device {
            id: id.to_string(),
            local_id: String::new(),
            name: id.to_string(),
            device_type_id: device_type_id.to_string(),
        }
    }

    fn resolver() -> TopicResolver {
        let device_types = [
            DeviceType {
                id: "dt1".to_string(),
                name: "dt1".to_string(),
                services: vec![service("void/poweron"), service("poweron"), service("tele/SENSOR")],
            },
            DeviceType {
                id: "dt2".to_string(),
                name: "dt2".to_string(),
                services: vec![service("a"), service("b"), service("c/long/match")],
            },
        ];
        let devices = [
            device(LONG, "dt1"),
            device(LONG_2, "dt1"),
            device(FORBIDDEN_LONG, "dt1"),
        ];
        TopicResolver::new(
            Arc::new(StaticRegistry {
                devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
                device_types: device_types.into_iter().map(|t| (t.id.clone(), t)).collect(),
            }),
            "{{.DeviceId}}/cmnd/{{.LocalServiceId}}",
        )
    }

    fn token() -> Token {
        Token::new("test")
    }

    #[tokio::test]
    async fn resolves_device_and_longest_service() {
        let resolver = resolver();
        let cases = vec![
            (format!("{SHORT}/void/poweron"), "void/poweron"),
            (format!("{SHORT}/poweron"), "poweron"),
            (format!("void/poweron/{SHORT}"), "void/poweron"),
            (format!("poweron/{SHORT}"), "poweron"),
            (format!("cmd/{SHORT}/void/poweron"), "void/poweron"),
            (format!("cmd/{SHORT}/poweron"), "poweron"),
            (format!("{LONG}/void/poweron"), "void/poweron"),
            (format!("{LONG}/poweron"), "poweron"),
            (format!("cmd/{LONG}/void/poweron"), "void/poweron"),
            (format!("{SHORT}/tele/SENSOR"), "tele/SENSOR"),
            (format!("{SHORT}/void/poweron/{UNKNOWN_SHORT}"), "void/poweron"),
            (format!("{UNKNOWN_LONG}/void/poweron/{SHORT}"), "void/poweron"),
            (format!("cmd/{SHORT}/{UNKNOWN_SHORT}/poweron"), "poweron"),
            (format!("{LONG}/poweron/{UNKNOWN_LONG}"), "poweron"),
            (format!("{SHORT}/{LONG}/poweron"), "poweron"),
        ];
        for (topic, expected_service) in cases {
            let resolved = resolver
                .parse(&token(), &topic)
                .await
                .unwrap_or_else(|e| panic!("{topic}: {e}"));
            assert_eq!(resolved.device.id, LONG, "{topic}");
            assert_eq!(resolved.service.local_id, expected_service, "{topic}");
        }
    }

    #[tokio::test]
    async fn topic_without_id_segment_has_no_candidate() {
        let err = resolver().parse(&token(), "cmd/foo/bar").await.unwrap_err();
        assert!(matches!(err, ParseError::NoDeviceIdCandidate));
    }

    #[tokio::test]
    async fn unknown_and_forbidden_devices_do_not_match() {
        let resolver = resolver();
        for topic in [
            format!("cmd/{UNKNOWN_LONG}/bar"),
            format!("{UNKNOWN_SHORT}/cmd/bar"),
            format!("cmd/{FORBIDDEN_LONG}/poweron"),
        ] {
            let err = resolver.parse(&token(), &topic).await.unwrap_err();
            assert!(matches!(err, ParseError::NoDeviceMatch), "{topic}: {err}");
        }
    }

    #[tokio::test]
    async fn two_devices_are_ambiguous() {
        let resolver = resolver();
        for topic in [
            format!("cmd/bar/{LONG_2}/{LONG}"),
            format!("{LONG}/cmd/bar/{SHORT_2}"),
            format!("{SHORT}/void/poweron/{SHORT_2}"),
        ] {
            let err = resolver.parse(&token(), &topic).await.unwrap_err();
            assert!(matches!(err, ParseError::MultipleMatchingDevices), "{topic}: {err}");
        }
    }

    #[tokio::test]
    async fn device_without_service_match_is_reported() {
        let err = resolver()
            .parse(&token(), &format!("{SHORT}/nothing/here"))
            .await
            .unwrap_err();
        match err {
            ParseError::NoServiceMatch(device) => assert_eq!(device.id, LONG),
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn registry_failures_abort_resolution() {
        let err = resolver()
            .parse(&token(), &format!("{BROKEN_LONG}/poweron"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Registry(RegistryError::Status(500))));
    }

    #[test]
    fn ranks_by_service_count_then_match_length() {
        let mut candidates = vec![
            Candidate {
                device: device("one-long", "dt2"),
                services: vec![service("c/long/match")],
            },
            Candidate {
                device: device("none", "dt2"),
                services: vec![],
            },
            Candidate {
                device: device("two-short", "dt2"),
                services: vec![service("a"), service("b")],
            },
            Candidate {
                device: device("one-short", "dt2"),
                services: vec![service("a")],
            },
        ];
        rank_candidates(&mut candidates);
        let order: Vec<&str> = candidates.iter().map(|c| c.device.id.as_str()).collect();
        assert_eq!(order, ["two-short", "one-long", "one-short", "none"]);
    }

    #[test]
    fn extracts_candidates_from_segments() {
        assert_eq!(device_id_candidates(&format!("x/{SHORT}/y")), vec![LONG.to_string()]);
        assert_eq!(device_id_candidates(&format!("{LONG}/y")), vec![LONG.to_string()]);
        assert_eq!(device_id_candidates(&format!("{SHORT}/{LONG}")), vec![LONG.to_string()]);
        assert!(device_id_candidates("senergy/temperature/celsius").is_empty());
        assert!(device_id_candidates(&format!("{SHORT}x/y")).is_empty());
        assert!(device_id_candidates("urn:infai:ses:device:/x").is_empty());
    }

    #[test]
    fn creates_topic_from_local_service_template() {
        let resolver = resolver();
        let cases = [
            ("{{.DeviceId}}/temperature", format!("{LONG}/temperature")),
            ("cmd/{{.DeviceId}}/temperature", format!("cmd/{LONG}/temperature")),
            ("cmd/temperature/{{.DeviceId}}", format!("cmd/temperature/{LONG}")),
            ("{{.ShortDeviceId}}/temperature", format!("{SHORT}/temperature")),
            ("cmd/{{ .ShortDeviceId }}/temperature", format!("cmd/{SHORT}/temperature")),
            ("temperature", format!("{LONG}/cmnd/temperature")),
            ("temperature/celsius", format!("{LONG}/cmnd/temperature/celsius")),
        ];
        for (local_service_id, expected) in cases {
            assert_eq!(resolver.create(LONG, local_service_id).unwrap(), expected);
        }
    }

    #[test]
    fn creates_topic_from_short_default_pattern() {
        let resolver = TopicResolver::new(
            resolver().registry,
            "{{.ShortDeviceId}}/cmnd/{{.LocalServiceId}}",
        );
        assert_eq!(
            resolver.create(LONG, "temperature").unwrap(),
            format!("{SHORT}/cmnd/temperature")
        );
        assert_eq!(
            resolver.create(LONG, "{{.DeviceId}}/temperature").unwrap(),
            format!("{LONG}/temperature")
        );
    }

    #[test]
    fn rejects_unknown_placeholder() {
        let err = resolver().create(LONG, "{{.Nope}}/x").unwrap_err();
        assert!(matches!(err, CreateError::UnknownPlaceholder(key) if key == "Nope"));
    }

    #[test]
    fn rejects_malformed_device_id() {
        assert!(matches!(
            resolver().create("urn:infai:ses:device:nope", "x"),
            Err(CreateError::ShortId(_))
        ));
    }
}
