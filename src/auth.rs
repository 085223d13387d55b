use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_PATH: &str = "/auth/realms/master/protocol/openid-connect/token";

/// Access token presented to the registry on behalf of a user.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        if self.0.starts_with("Bearer ") {
            self.0.clone()
        } else {
            format!("Bearer {}", self.0)
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("access denied")]
    AccessDenied,
    #[error("token endpoint rejected request with status {0}")]
    Rejected(u16),
    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait Auth: Send + Sync {
    /// Exchanges login credentials for an access token.
    ///
    /// `None` as password means the broker already authenticated the user by
    /// client certificate, so only a token exchange for `username` is done.
    async fn exchange_credential_for_token(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<Token, AuthError>;

    /// Token for `username`, reused until shortly before it expires.
    async fn get_cached_user_token(&self, username: &str) -> Result<Token, AuthError>;
}

#[derive(Debug, Deserialize)]
struct OpenIdToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    token: Token,
    expires_at: Instant,
}

/// OpenID-Connect client using password grants and token exchange.
pub struct OpenIdAuth {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    expiration_buffer: Duration,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl OpenIdAuth {
    pub fn new(
        endpoint: &str,
        client_id: &str,
        client_secret: &str,
        expiration_buffer: Duration,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder().timeout(TOKEN_TIMEOUT).build()?;
        Ok(Self {
            http,
            token_url: format!("{}{}", endpoint.trim_end_matches('/'), TOKEN_PATH),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            expiration_buffer,
            cache: Mutex::new(HashMap::new()),
        })
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<OpenIdToken, AuthError> {
        let response = self.http.post(&self.token_url).form(form).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::AccessDenied);
        }
        if !status.is_success() {
            return Err(AuthError::Rejected(status.as_u16()));
        }
        Ok(response.json::<OpenIdToken>().await?)
    }

    async fn exchange_user_token(&self, username: &str) -> Result<OpenIdToken, AuthError> {
        self.request_token(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("requested_subject", username),
        ])
        .await
    }
}

#[async_trait]
impl Auth for OpenIdAuth {
    async fn exchange_credential_for_token(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<Token, AuthError> {
        let token = match password {
            Some(password) => {
                self.request_token(&[
                    ("grant_type", "password"),
                    ("client_id", &self.client_id),
                    ("client_secret", &self.client_secret),
                    ("username", username),
                    ("password", password),
                ])
                .await?
            }
            None => self.exchange_user_token(username).await?,
        };
        Ok(Token::new(token.access_token))
    }

    async fn get_cached_user_token(&self, username: &str) -> Result<Token, AuthError> {
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(username) {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.token.clone());
                }
            }
        }

        debug!(username, "requesting user token");
        let fresh = self.exchange_user_token(username).await?;
        let token = Token::new(fresh.access_token);
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(self.expiration_buffer);
        if !lifetime.is_zero() {
            self.cache.lock().await.insert(
                username.to_string(),
                CachedToken {
                    token: token.clone(),
                    expires_at: Instant::now() + lifetime,
                },
            );
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_adds_scheme_once() {
        assert_eq!(Token::new("abc").bearer(), "Bearer abc");
        assert_eq!(Token::new("Bearer abc").bearer(), "Bearer abc");
    }

    #[test]
    fn debug_hides_token() {
        assert_eq!(format!("{:?}", Token::new("secret")), "Token(***)");
    }

    #[test]
    fn token_url_joins_endpoint() {
        let auth = OpenIdAuth::new("http://keycloak:8080/", "bridge", "s3cret", Duration::ZERO)
            .unwrap();
        assert_eq!(
            auth.token_url,
            "http://keycloak:8080/auth/realms/master/protocol/openid-connect/token"
        );
    }
}
