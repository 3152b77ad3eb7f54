//! Validates the short-lived JWTs the server issues to users of the proxy.

use std::time::Duration;

use http::header::AUTHORIZATION;
use http::HeaderMap;
use service_core::api::{verify_token, Jwk, JwkSet, TokenClaims};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::ConnectorError;

/// How long a fetched JWK is trusted before the set is fetched again.
pub const JWK_CACHE_REFRESH: Duration = Duration::from_secs(5 * 60);

struct CachedKey {
    key: Jwk,
    fetched_at: Instant,
}

pub struct JwkAuthenticator {
    http: reqwest::Client,
    jwks_url: String,
    refresh: Duration,
    cache: Mutex<Option<CachedKey>>,
}

impl JwkAuthenticator {
    pub fn new(server_url: &str) -> Result<Self, ConnectorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConnectorError::Config(format!("http client: {}", e)))?;
        Ok(Self::with_client(http, server_url, JWK_CACHE_REFRESH))
    }

    pub fn with_client(http: reqwest::Client, server_url: &str, refresh: Duration) -> Self {
        Self {
            http,
            jwks_url: format!("{}/.well-known/jwks.json", server_url.trim_end_matches('/')),
            refresh,
            cache: Mutex::new(None),
        }
    }

    /// The server's signing key. Held across the fetch so concurrent
    /// requests trigger one download.
    async fn jwk(&self) -> Result<Jwk, ConnectorError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.refresh {
                return Ok(cached.key.clone());
            }
        }

        let set: JwkSet = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ConnectorError::authentication(format!("get JWK from server: {}", e)))?
            .json()
            .await
            .map_err(|e| ConnectorError::authentication(format!("get JWK from server: {}", e)))?;

        let key = set
            .keys
            .into_iter()
            .next()
            .ok_or_else(|| ConnectorError::authentication("no jwks provided"))?;

        tracing::debug!(kid = %key.kid, "Refreshed server JWK");
        *cache = Some(CachedKey {
            key: key.clone(),
            fetched_at: Instant::now(),
        });
        Ok(key)
    }

    /// Check the bearer token on a request and return its claims.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<TokenClaims, ConnectorError> {
        let raw = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
            .unwrap_or_default();
        if raw.is_empty() {
            return Err(ConnectorError::authentication("no bearer token found"));
        }

        let key = self.jwk().await?;
        let claims = verify_token(raw, &key)
            .map_err(|e| ConnectorError::authentication(format!("invalid JWT: {}", e)))?;

        if claims.name.is_empty() {
            return Err(ConnectorError::authentication("no username in JWT claims"));
        }
        Ok(claims)
    }
}
