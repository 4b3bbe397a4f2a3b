use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::GatewayError;

const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Tokens are refreshed this long before the provider says they expire.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Duration,
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken, GatewayError>;
}

/// OAuth2 client-credentials grant against the Microsoft identity platform.
pub struct ClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    pub fn new(http: reqwest::Client, tenant_id: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            http,
            token_url: format!("{LOGIN_BASE}/{tenant_id}/oauth2/v2.0/token"),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[async_trait]
impl TokenSource for ClientCredentials {
    async fn fetch_token(&self) -> Result<AccessToken, GatewayError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Auth(format!("token endpoint returned {status}: {body}")));
        }
        let data: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Auth(e.to_string()))?;
        Ok(AccessToken {
            token: data.access_token,
            expires_in: Duration::from_secs(data.expires_in),
        })
    }
}

struct Cached {
    token: String,
    refresh_at: Instant,
}

/// Hands out the cached token until `expires_in - skew` has elapsed, then
/// refetches. Concurrent callers wait on one refresh.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    skew: Duration,
    cached: Mutex<Option<Cached>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self::with_skew(source, DEFAULT_EXPIRY_SKEW)
    }

    pub fn with_skew(source: Arc<dyn TokenSource>, skew: Duration) -> Self {
        Self {
            source,
            skew,
            cached: Mutex::new(None),
        }
    }

    pub async fn get_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref()
            && Instant::now() < c.refresh_at
        {
            return Ok(c.token.clone());
        }
        let fresh = self.source.fetch_token().await?;
        tracing::debug!("access token refreshed, valid for {:?}", fresh.expires_in);
        *cached = Some(Cached {
            token: fresh.token.clone(),
            refresh_at: Instant::now() + fresh.expires_in.saturating_sub(self.skew),
        });
        Ok(fresh.token)
    }

    /// Forget the cached token, e.g. after the provider rejected it.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}
