//! Broker webhook endpoints.
//!
//! The broker asks before every login, publish and subscribe whether to let it
//! happen, and informs about sessions coming online and going away. Every
//! answer is a 200 with a JSON body; rejections are expressed inside the body.

use crate::auth::{Auth, Token};
use crate::bus::{self, Producer};
use crate::config::AuthMethod;
use crate::connection_log::ConnectionLog;
use crate::models::{now_rfc3339, DeviceEvent};
use crate::notify::{Notification, Notifier};
use crate::topic::{ParseError, Resolved, TopicResolver};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::middleware::map_response;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Display;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Subscription qos telling the broker the topic was refused.
pub const REJECTED_QOS: i64 = 128;

pub const IGNORED_TOPIC_PREFIX: &str = "ignored/";

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    client_id: String,
    #[serde(default)]
    clean_session: bool,
    #[serde(default)]
    clean_start: bool,
}

#[derive(Debug, Deserialize)]
struct ClientRequest {
    client_id: String,
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    #[serde(default)]
    username: String,
    client_id: String,
    topic: String,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    qos: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicQos {
    pub topic: String,
    pub qos: i64,
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    #[serde(default)]
    username: String,
    client_id: String,
    #[serde(default)]
    topics: Vec<TopicQos>,
}

#[derive(Debug, Deserialize)]
struct UnsubscribeRequest {
    #[serde(default)]
    username: String,
    client_id: String,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Debug, Serialize)]
struct OkResponse {
    result: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResult {
    error: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    result: ErrorResult,
}

#[derive(Debug, Serialize)]
struct RedirectModifiers {
    topic: String,
    payload: String,
    retain: bool,
    qos: u8,
}

#[derive(Debug, Serialize)]
struct RedirectResponse {
    result: &'static str,
    modifiers: RedirectModifiers,
}

#[derive(Debug, Serialize)]
struct SubscribeResponse {
    result: &'static str,
    topics: Vec<TopicQos>,
}

#[derive(Debug, Serialize)]
struct UnsubscribeResponse {
    result: &'static str,
    topics: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EmptyResponse {}

pub struct WebhookState {
    /// The bridge's own credential; its clients are never checked.
    pub auth_client_id: String,
    pub auth_method: AuthMethod,
    pub auth: Arc<dyn Auth>,
    pub resolver: Arc<TopicResolver>,
    pub connection_log: Arc<dyn ConnectionLog>,
    pub producer: Arc<dyn Producer>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl WebhookState {
    fn error_reply(&self, message: impl Display) -> Response {
        let message = message.to_string();
        debug!(error = %message, "send error");
        error_body(message)
    }

    fn decode<T: DeserializeOwned>(&self, endpoint: &str, body: &Bytes) -> Result<T, Response> {
        serde_json::from_slice(body).map_err(|e| {
            warn!(endpoint, error = %e, "malformed webhook message");
            self.error_reply(e)
        })
    }

    async fn user_token(&self, username: &str) -> Result<Token, Response> {
        self.auth.get_cached_user_token(username).await.map_err(|e| {
            warn!(username, error = %e, "unable to get user token");
            self.error_reply(e)
        })
    }

    fn notify_ignored(&self, username: &str, client: &str, topic: &str, payload: &str) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let notification = Notification {
            user_id: username.to_string(),
            title: "Client-Error".to_string(),
            message: format!("{}: ignore message to {}: {}", client, topic, payload),
        };
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notification).await {
                error!(error = %e, "unable to send notification");
            }
        });
    }
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/online", post(online))
        .route("/disconnect", post(disconnect))
        .route("/publish", post(publish))
        .route("/subscribe", post(subscribe))
        .route("/unsubscribe", post(unsubscribe))
        .layer(DefaultBodyLimit::disable())
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(map_response(oversized_as_error))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn reply<T: Serialize>(body: T) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

fn ok() -> Response {
    reply(OkResponse { result: "ok" })
}

fn error_body(message: String) -> Response {
    reply(ErrorResponse {
        result: ErrorResult { error: message },
    })
}

/// The body limit answers 413, which the broker would take as a hard denial.
async fn oversized_as_error(response: Response) -> Response {
    if response.status() != StatusCode::PAYLOAD_TOO_LARGE {
        return response;
    }
    warn!(limit = MAX_BODY_BYTES, "webhook message too large");
    error_body(format!("message exceeds {} bytes", MAX_BODY_BYTES))
}

/// Keeps the broker talking to us after a handler panicked.
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %message, "webhook handler panicked");
    error_body(message)
}

async fn login(State(state): State<Arc<WebhookState>>, body: Bytes) -> Response {
    let msg: LoginRequest = match state.decode("login", &body) {
        Ok(msg) => msg,
        Err(response) => return response,
    };
    let clean_session = msg.clean_session || msg.clean_start;
    info!(
        client = %msg.client_id,
        username = %msg.username,
        method = ?state.auth_method,
        clean_session,
        "login"
    );
    if msg.username == state.auth_client_id {
        return ok();
    }

    let password = match state.auth_method {
        AuthMethod::Password => Some(msg.password.as_str()),
        AuthMethod::Certificate => None,
    };
    match state
        .auth
        .exchange_credential_for_token(&msg.username, password)
        .await
    {
        Ok(token) if token.is_empty() => return state.error_reply("access denied"),
        Ok(_) => {}
        Err(e) => {
            warn!(client = %msg.client_id, username = %msg.username, error = %e, "login rejected");
            return state.error_reply(e);
        }
    }
    if let Err(e) = state
        .connection_log
        .record_login(&msg.client_id, clean_session)
        .await
    {
        error!(client = %msg.client_id, error = %e, "unable to store session flag");
    }
    ok()
}

async fn online(State(state): State<Arc<WebhookState>>, body: Bytes) -> Response {
    let msg: ClientRequest = match state.decode("online", &body) {
        Ok(msg) => msg,
        Err(response) => return response,
    };
    debug!(client = %msg.client_id, "online");
    if let Err(e) = state.connection_log.record_reconnect(&msg.client_id).await {
        error!(client = %msg.client_id, error = %e, "unable to reconnect client");
    }
    reply(EmptyResponse {})
}

async fn disconnect(State(state): State<Arc<WebhookState>>, body: Bytes) -> Response {
    let msg: ClientRequest = match state.decode("disconnect", &body) {
        Ok(msg) => msg,
        Err(response) => return response,
    };
    debug!(client = %msg.client_id, "disconnect");
    if let Err(e) = state.connection_log.record_disconnect(&msg.client_id).await {
        error!(client = %msg.client_id, error = %e, "unable to disconnect client");
    }
    reply(EmptyResponse {})
}

async fn publish(State(state): State<Arc<WebhookState>>, body: Bytes) -> Response {
    let msg: PublishRequest = match state.decode("publish", &body) {
        Ok(msg) => msg,
        Err(response) => return response,
    };
    if msg.username == state.auth_client_id {
        return ok();
    }
    let payload = match STANDARD.decode(&msg.payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(client = %msg.client_id, topic = %msg.topic, error = %e, "payload is not base64");
            return state.error_reply(e);
        }
    };
    let token = match state.user_token(&msg.username).await {
        Ok(token) => token,
        Err(response) => return response,
    };

    let Resolved { device, service } = match state.resolver.parse(&token, &msg.topic).await {
        Ok(resolved) => resolved,
        Err(
            e @ (ParseError::NoDeviceIdCandidate
            | ParseError::NoDeviceMatch
            | ParseError::NoServiceMatch(_)),
        ) => {
            warn!(client = %msg.client_id, topic = %msg.topic, reason = %e, "ignoring publish");
            state.notify_ignored(&msg.username, &msg.client_id, &msg.topic, &msg.payload);
            // The payload is already base64 and is passed on as is, not encoded
            // a second time, so `ignored/<topic>` carries the device's bytes.
            return reply(RedirectResponse {
                result: "ok",
                modifiers: RedirectModifiers {
                    topic: format!("{}{}", IGNORED_TOPIC_PREFIX, msg.topic),
                    payload: msg.payload,
                    retain: false,
                    qos: 0,
                },
            });
        }
        Err(e) => {
            warn!(client = %msg.client_id, topic = %msg.topic, error = %e, "unable to parse topic");
            return state.error_reply(e);
        }
    };

    let event = DeviceEvent {
        device_id: device.id,
        local_device_id: device.local_id,
        service_id: service.id,
        local_service_id: service.local_id,
        payload: String::from_utf8_lossy(&payload).into_owned(),
        qos: msg.qos,
        time: now_rfc3339(),
    };
    let bus_topic = bus::service_topic(&event.service_id);
    if let Err(e) = bus::send_json(state.producer.as_ref(), &bus_topic, &event.device_id, &event).await {
        warn!(
            client = %msg.client_id,
            topic = %msg.topic,
            device = %event.device_id,
            service = %event.service_id,
            error = %e,
            "unable to forward device event"
        );
    }
    ok()
}

async fn subscribe(State(state): State<Arc<WebhookState>>, body: Bytes) -> Response {
    let msg: SubscribeRequest = match state.decode("subscribe", &body) {
        Ok(msg) => msg,
        Err(response) => return response,
    };
    if msg.username == state.auth_client_id {
        return reply(SubscribeResponse {
            result: "ok",
            topics: msg.topics,
        });
    }
    let token = match state.user_token(&msg.username).await {
        Ok(token) => token,
        Err(response) => return response,
    };

    let mut topics = Vec::with_capacity(msg.topics.len());
    for mut entry in msg.topics {
        let device = match state.resolver.parse(&token, &entry.topic).await {
            Ok(resolved) => Some(resolved.device),
            // Device level access is enough to subscribe.
            Err(ParseError::NoServiceMatch(device)) => Some(*device),
            Err(ParseError::NoDeviceIdCandidate) => None,
            Err(e @ (ParseError::MultipleMatchingDevices | ParseError::NoDeviceMatch)) => {
                info!(client = %msg.client_id, topic = %entry.topic, reason = %e, "subscription rejected");
                entry.qos = REJECTED_QOS;
                None
            }
            Err(e) => {
                warn!(client = %msg.client_id, topic = %entry.topic, error = %e, "unable to parse topic");
                return state.error_reply(e);
            }
        };
        if let Some(device) = device {
            if let Err(e) = state
                .connection_log
                .record_subscribe(&msg.client_id, &entry.topic, &device.id)
                .await
            {
                error!(
                    client = %msg.client_id,
                    topic = %entry.topic,
                    device = %device.id,
                    error = %e,
                    "unable to store subscription"
                );
            }
        }
        topics.push(entry);
    }
    reply(SubscribeResponse {
        result: "ok",
        topics,
    })
}

async fn unsubscribe(State(state): State<Arc<WebhookState>>, body: Bytes) -> Response {
    let msg: UnsubscribeRequest = match state.decode("unsubscribe", &body) {
        Ok(msg) => msg,
        Err(response) => return response,
    };
    if msg.username != state.auth_client_id {
        match state.auth.get_cached_user_token(&msg.username).await {
            Ok(token) => {
                for topic in &msg.topics {
                    forget_subscription(&state, &token, &msg.client_id, topic).await;
                }
            }
            Err(e) => warn!(username = %msg.username, error = %e, "unable to get user token"),
        }
    }
    reply(UnsubscribeResponse {
        result: "ok",
        topics: msg.topics,
    })
}

async fn forget_subscription(state: &WebhookState, token: &Token, client: &str, topic: &str) {
    match state.resolver.parse(token, topic).await {
        Ok(_) | Err(ParseError::NoServiceMatch(_)) => {}
        Err(e) => {
            debug!(client, topic, reason = %e, "unsubscribe of unresolvable topic");
            return;
        }
    }
    if let Err(e) = state.connection_log.record_unsubscribe(client, topic).await {
        error!(client, topic, error = %e, "unable to remove subscription");
    }
}
