//! Magic-link login and token lifecycle.
//!
//! Logging in is a three step dance: ask the API to mail a login link,
//! poll the login request until the user has clicked it, then exchange the
//! temporary password for a token with the `one_time_password` grant.
//! Tokens are renewed with the `refresh_token` grant against the same
//! endpoint.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::ClientConfig;
use crate::client::Endpoint;
use crate::error::ApiError;
use crate::error::ApiResult;

const LOGIN_REQUEST_RESOURCE: &str = "auth/request";
const TOKEN_RESOURCE: &str = "oauth/token";

/// Tokens are treated as expired this long before they actually expire.
const EXPIRY_MARGIN_SECS: i64 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

impl TokenResponse {
    fn into_token(self, now: DateTime<Utc>, previous_refresh: Option<&str>) -> ApiResult<Token> {
        let refresh_token = self
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_owned))
            .ok_or_else(|| {
                ApiError::UnexpectedResponse("token response without refresh_token".to_string())
            })?;

        Ok(Token {
            access_token: self.access_token,
            refresh_token,
            expires_at: now + chrono::Duration::seconds(self.expires_in),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
enum Grant<'a> {
    OneTimePassword { email: &'a str, password: &'a str },
    RefreshToken { refresh_token: &'a str },
}

/// Persistence for the token blob.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<Token>, Box<dyn Error + Send + Sync>>;

    async fn save(&self, token: &Token) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Unauthenticated side of the API.
#[derive(Clone)]
pub struct AuthClient {
    endpoint: Endpoint,
}

impl AuthClient {
    pub fn new(config: &ClientConfig) -> ApiResult<Self> {
        Ok(Self::from_endpoint(Endpoint::new(config)?))
    }

    pub(crate) fn from_endpoint(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Ask for a login link to be mailed to `email`. Returns the uuid of
    /// the login request.
    pub async fn request_login(&self, email: &str) -> ApiResult<String> {
        let url = self.endpoint.url(LOGIN_REQUEST_RESOURCE);
        let response = self
            .endpoint
            .http
            .post(&url)
            .json(&json!({ "email": email }))
            .send()
            .await?;
        let body = Self::success_body(response).await?;

        body.get("data")
            .and_then(|d| d.get("uuid"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ApiError::UnexpectedResponse("login request without uuid".to_string()))
    }

    /// Check a login request once. Yields a token after the link was used.
    pub async fn poll_login(&self, email: &str, uuid: &str) -> ApiResult<Option<Token>> {
        let url = self
            .endpoint
            .url(&format!("{}/{}", LOGIN_REQUEST_RESOURCE, uuid));
        let response = self.endpoint.http.get(&url).send().await?;
        let body = Self::success_body(response).await?;

        let Some(data) = body.get("data") else {
            return Ok(None);
        };
        let activated = data
            .get("is_activated")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let password = data.get("password").and_then(Value::as_str);

        match (activated, password) {
            (true, Some(password)) => {
                debug!("Login request {} activated", uuid);
                let token = self
                    .request_token(Grant::OneTimePassword { email, password }, None)
                    .await?;
                Ok(Some(token))
            }
            _ => Ok(None),
        }
    }

    /// Poll a login request every `interval` until it is used or `timeout`
    /// has passed.
    pub async fn wait_for_login(
        &self,
        email: &str,
        uuid: &str,
        interval: Duration,
        timeout: Duration,
    ) -> ApiResult<Token> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(token) = self.poll_login(email, uuid).await? {
                return Ok(token);
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(ApiError::AuthFailed(
                    "login link was not used in time".to_string(),
                ));
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn refresh(&self, token: &Token) -> ApiResult<Token> {
        self.request_token(
            Grant::RefreshToken {
                refresh_token: &token.refresh_token,
            },
            Some(&token.refresh_token),
        )
        .await
    }

    async fn request_token(
        &self,
        grant: Grant<'_>,
        previous_refresh: Option<&str>,
    ) -> ApiResult<Token> {
        let url = self.endpoint.url(TOKEN_RESOURCE);
        let response = self.endpoint.http.post(&url).json(&grant).send().await?;
        let status = response.status();

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::AuthFailed(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }

        let body = response.bytes().await?;
        let parsed: TokenResponse = serde_json::from_slice(&body)?;
        parsed.into_token(Utc::now(), previous_refresh)
    }

    async fn success_body(response: reqwest::Response) -> ApiResult<Value> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// The token shared by every request.
///
/// Refreshes happen under the token lock, so callers that find an expired
/// token at the same time trigger a single refresh and all see its result.
pub struct Session {
    auth: AuthClient,
    token: Mutex<Option<Token>>,
    store: Option<Arc<dyn TokenStore>>,
}

impl Session {
    pub fn new(auth: AuthClient, token: Option<Token>, store: Option<Arc<dyn TokenStore>>) -> Self {
        Self {
            auth,
            token: Mutex::new(token),
            store,
        }
    }

    /// A currently valid access token, refreshed first if needed.
    pub async fn access_token(&self) -> ApiResult<String> {
        let mut slot = self.token.lock().await;
        let token = slot.as_ref().ok_or(ApiError::NoToken)?;
        if !token.is_expired(Utc::now()) {
            return Ok(token.access_token.clone());
        }

        debug!("Access token expired, refreshing");
        let refreshed = self.auth.refresh(token).await?;
        let access = refreshed.access_token.clone();
        self.persist(&refreshed).await;
        *slot = Some(refreshed);
        Ok(access)
    }

    /// Refresh regardless of expiry, e.g. after the API rejected the token.
    pub async fn force_refresh(&self) -> ApiResult<()> {
        let mut slot = self.token.lock().await;
        let token = slot.as_ref().ok_or(ApiError::NoToken)?;
        let refreshed = self.auth.refresh(token).await?;
        info!("Access token refreshed");
        self.persist(&refreshed).await;
        *slot = Some(refreshed);
        Ok(())
    }

    pub async fn set_token(&self, token: Token) {
        self.persist(&token).await;
        *self.token.lock().await = Some(token);
    }

    pub async fn token(&self) -> Option<Token> {
        self.token.lock().await.clone()
    }

    async fn persist(&self, token: &Token) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(token).await {
                warn!("Failed to persist token: {}", e);
            }
        }
    }
}
