//! OIDC client used for federated login and provider-user refresh.
//!
//! Endpoints are discovered from `/.well-known/openid-configuration` on every
//! call. ID tokens are verified against the provider's JWKS.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use service_core::axum::async_trait;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::models::{Provider, ProviderKind, ProviderUser};

/// Per-request timeout toward an identity provider.
pub const OIDC_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Group membership endpoint for Azure providers.
pub const GRAPH_MEMBER_OF_URL: &str = "https://graph.microsoft.com/v1.0/me/memberOf";
const GRAPH_GROUP_TYPE: &str = "#microsoft.graph.group";

/// Access tokens this close to expiry are refreshed early.
const EXPIRY_MARGIN_SECONDS: i64 = 10;

/// Tokens returned by a successful code exchange.
#[derive(Clone)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Email from the verified ID token.
    pub email: String,
}

impl std::fmt::Debug for ProviderTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderTokens")
            .field("email", &self.email)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[async_trait]
pub trait OidcClient: Send + Sync {
    /// Trade an authorization code for tokens and the user's verified email.
    async fn exchange_code(&self, code: &str, redirect_url: &str) -> Result<ProviderTokens, AppError>;

    /// The user's current access token, refreshed first when it has expired.
    async fn refresh_access_token(
        &self,
        user: &ProviderUser,
    ) -> Result<(String, Option<DateTime<Utc>>), AppError>;

    /// Read the user's profile and group names. `Forbidden` means the
    /// provider no longer recognizes the user.
    async fn user_info(&self, user: &ProviderUser) -> Result<UserInfo, AppError>;
}

/// Builds an [`OidcClient`] for a stored provider.
pub trait OidcClientFactory: Send + Sync {
    fn client_for(&self, provider: &Provider) -> Arc<dyn OidcClient>;
}

#[derive(Clone)]
pub struct ReqwestOidcFactory {
    http: reqwest::Client,
    graph_url: String,
}

impl ReqwestOidcFactory {
    pub fn new() -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(OIDC_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("building oidc http client: {}", e)))?;
        Ok(Self {
            http,
            graph_url: GRAPH_MEMBER_OF_URL.to_string(),
        })
    }

    pub fn with_graph_url(mut self, url: impl Into<String>) -> Self {
        self.graph_url = url.into();
        self
    }
}

impl OidcClientFactory for ReqwestOidcFactory {
    fn client_for(&self, provider: &Provider) -> Arc<dyn OidcClient> {
        Arc::new(HttpOidcClient {
            http: self.http.clone(),
            base_url: base_url(&provider.url),
            client_id: provider.client_id.clone(),
            client_secret: provider.client_secret.clone(),
            kind: provider.kind(),
            graph_url: self.graph_url.clone(),
        })
    }
}

/// `https://<domain>` unless the provider URL already carries a scheme.
fn base_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

#[derive(Debug, Deserialize)]
struct Discovery {
    issuer: String,
    token_endpoint: String,
    #[serde(default)]
    userinfo_endpoint: String,
    jwks_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    id_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Deserialize)]
struct GraphObject {
    #[serde(rename = "@odata.type", default)]
    kind: String,
    #[serde(rename = "displayName", default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    #[serde(default)]
    value: Vec<GraphObject>,
}

pub struct HttpOidcClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    kind: ProviderKind,
    graph_url: String,
}

/// 401 and 403 mean the provider rejected the user; other failures are the
/// provider's problem.
fn check_status(resp: Response, what: &str) -> Result<Response, AppError> {
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AppError::Forbidden(anyhow::anyhow!(
            "identity provider rejected the {} request",
            what
        ))),
        s => Err(AppError::BadGateway(format!("{} request returned {}", what, s))),
    }
}

/// Emails from an ID token become identity names; reject ones that can't be.
fn validate_email(email: &str) -> Result<(), AppError> {
    if email.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "identity provider did not return an email claim"
        )));
    }
    if email.contains(' ') || email.contains('\'') {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "email {:?} contains characters that are not allowed",
            email
        )));
    }
    Ok(())
}

fn expires_at(expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_in
        .filter(|secs| *secs > 0)
        .map(|secs| Utc::now() + Duration::seconds(secs))
}

impl HttpOidcClient {
    async fn discover(&self) -> Result<Discovery, AppError> {
        let url = format!("{}/.well-known/openid-configuration", self.base_url);
        let resp = self.http.get(&url).send().await?;
        Ok(check_status(resp, "discovery")?.json().await?)
    }

    async fn verify_id_token(&self, discovery: &Discovery, id_token: &str) -> Result<IdTokenClaims, AppError> {
        let header = decode_header(id_token)?;
        if matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "id token uses a symmetric algorithm"
            )));
        }

        let resp = self.http.get(&discovery.jwks_uri).send().await?;
        let jwks: JwkSet = check_status(resp, "jwks")?.json().await?;
        let jwk = match header.kid.as_deref() {
            Some(kid) => jwks.find(kid),
            None => jwks.keys.first(),
        }
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("no matching key for id token")))?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&[&discovery.issuer]);
        let data = decode::<IdTokenClaims>(id_token, &DecodingKey::from_jwk(jwk)?, &validation)?;
        Ok(data.claims)
    }

    async fn graph_groups(&self, access_token: &str) -> Result<Option<Vec<String>>, AppError> {
        let resp = self.http.get(&self.graph_url).bearer_auth(access_token).send().await?;
        if resp.status() == StatusCode::FORBIDDEN {
            return Ok(None);
        }
        let body: GraphResponse = check_status(resp, "group membership")?.json().await?;
        Ok(Some(
            body.value
                .into_iter()
                .filter(|o| o.kind == GRAPH_GROUP_TYPE)
                .map(|o| o.display_name)
                .collect(),
        ))
    }
}

#[async_trait]
impl OidcClient for HttpOidcClient {
    #[instrument(skip(self, code), fields(provider = %self.base_url))]
    async fn exchange_code(&self, code: &str, redirect_url: &str) -> Result<ProviderTokens, AppError> {
        let discovery = self.discover().await?;
        let resp = self
            .http
            .post(&discovery.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_url),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        let tokens: TokenResponse = check_status(resp, "code exchange")?.json().await?;

        if tokens.id_token.is_empty() {
            return Err(AppError::BadGateway("code exchange returned no id_token".to_string()));
        }
        if tokens.refresh_token.is_empty() {
            warn!("No refresh token returned, session lifetime will be reduced");
        }

        let claims = self.verify_id_token(&discovery, &tokens.id_token).await?;
        validate_email(&claims.email)?;

        Ok(ProviderTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: expires_at(tokens.expires_in),
            email: claims.email,
        })
    }

    #[instrument(skip(self, user), fields(identity_id = %user.identity_id))]
    async fn refresh_access_token(
        &self,
        user: &ProviderUser,
    ) -> Result<(String, Option<DateTime<Utc>>), AppError> {
        let expired = user
            .expires_at
            .is_some_and(|exp| exp <= Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECONDS));
        if !expired && !user.access_token.is_empty() {
            return Ok((user.access_token.clone(), user.expires_at));
        }
        if user.refresh_token.is_empty() {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "provider access token expired and no refresh token is stored"
            )));
        }

        let discovery = self.discover().await?;
        let resp = self
            .http
            .post(&discovery.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", user.refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        if resp.status() == StatusCode::BAD_REQUEST {
            // invalid_grant: the provider revoked the session
            return Err(AppError::Forbidden(anyhow::anyhow!("provider refused to refresh the session")));
        }
        let tokens: TokenResponse = check_status(resp, "token refresh")?.json().await?;
        debug!("Refreshed provider access token");
        Ok((tokens.access_token, expires_at(tokens.expires_in)))
    }

    #[instrument(skip(self, user), fields(identity_id = %user.identity_id))]
    async fn user_info(&self, user: &ProviderUser) -> Result<UserInfo, AppError> {
        let discovery = self.discover().await?;
        if discovery.userinfo_endpoint.is_empty() {
            return Err(AppError::BadGateway("provider has no userinfo endpoint".to_string()));
        }
        let resp = self
            .http
            .get(&discovery.userinfo_endpoint)
            .bearer_auth(&user.access_token)
            .send()
            .await?;
        let mut info: UserInfo = check_status(resp, "userinfo")?.json().await?;

        if info.email.is_empty() && info.name.is_empty() {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "user info must contain an email or a name"
            )));
        }

        if self.kind == ProviderKind::Azure {
            match self.graph_groups(&user.access_token).await? {
                Some(groups) => info.groups = groups,
                None => {
                    warn!("Unable to read groups from the Azure API, check the application's permissions");
                    info.groups = Vec::new();
                }
            }
        }

        if info.groups.is_empty() {
            debug!("No groups returned in user info");
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::jwt::{generate_signing_jwk, sign_claims};
    use service_core::api::{Jwk, JwkSet as PublicJwkSet};
    use service_core::uid::Id;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, kind: ProviderKind) -> Provider {
        let now = Utc::now();
        Provider {
            id: Id::from_i64(7),
            organization_id: Id::from_i64(1),
            created_at: now,
            updated_at: now,
            name: "okta".into(),
            kind: kind.to_string(),
            url: server.uri(),
            client_id: "client-id".into(),
            client_secret: "client-secret".into(),
            auth_url: String::new(),
            scopes: Vec::new(),
            private_key: String::new(),
            client_email: String::new(),
            domain_admin_email: String::new(),
            created_by: Id::default(),
        }
    }

    fn provider_user(access_token: &str, refresh_token: &str, expires_at: Option<DateTime<Utc>>) -> ProviderUser {
        ProviderUser {
            identity_id: Id::from_i64(3),
            provider_id: Id::from_i64(7),
            organization_id: Id::from_i64(1),
            email: "joe@example.com".into(),
            groups: Vec::new(),
            last_update: Utc::now(),
            redirect_url: "http://localhost/callback".into(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            active: true,
        }
    }

    async fn mount_discovery(server: &MockServer) {
        let body = serde_json::json!({
            "issuer": server.uri(),
            "token_endpoint": format!("{}/token", server.uri()),
            "userinfo_endpoint": format!("{}/userinfo", server.uri()),
            "jwks_uri": format!("{}/keys", server.uri()),
        });
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_keys(server: &MockServer, key: &Jwk) {
        let set = PublicJwkSet { keys: vec![key.public()] };
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(set))
            .mount(server)
            .await;
    }

    fn id_token(server: &MockServer, key: &Jwk, aud: &str, email: &str) -> String {
        let claims = serde_json::json!({
            "iss": server.uri(),
            "aud": aud,
            "exp": (Utc::now() + Duration::minutes(5)).timestamp(),
            "email": email,
        });
        sign_claims(key, &claims).unwrap()
    }

    async fn mount_token(server: &MockServer, id_token: String) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "acc",
                "refresh_token": "ref",
                "id_token": id_token,
                "expires_in": 3600,
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn base_url_defaults_to_https() {
        assert_eq!(base_url("example.okta.com"), "https://example.okta.com");
        assert_eq!(base_url("http://127.0.0.1:9000/"), "http://127.0.0.1:9000");
    }

    #[test]
    fn emails_with_spaces_or_quotes_are_rejected() {
        assert!(validate_email("joe@example.com").is_ok());
        assert!(validate_email("").is_err());
        assert!(validate_email("joe smith@example.com").is_err());
        assert!(validate_email("o'neil@example.com").is_err());
    }

    #[tokio::test]
    async fn exchanges_code_and_verifies_id_token() {
        let server = MockServer::start().await;
        let key = generate_signing_jwk();
        mount_discovery(&server).await;
        mount_keys(&server, &key).await;
        mount_token(&server, id_token(&server, &key, "client-id", "joe@example.com")).await;

        let client = ReqwestOidcFactory::new().unwrap().client_for(&provider(&server, ProviderKind::Oidc));
        let tokens = client.exchange_code("code", "http://localhost/callback").await.unwrap();
        assert_eq!(tokens.email, "joe@example.com");
        assert_eq!(tokens.access_token, "acc");
        assert_eq!(tokens.refresh_token, "ref");
        assert!(tokens.expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn id_token_for_another_audience_is_rejected() {
        let server = MockServer::start().await;
        let key = generate_signing_jwk();
        mount_discovery(&server).await;
        mount_keys(&server, &key).await;
        mount_token(&server, id_token(&server, &key, "someone-else", "joe@example.com")).await;

        let client = ReqwestOidcFactory::new().unwrap().client_for(&provider(&server, ProviderKind::Oidc));
        let err = client.exchange_code("code", "http://localhost/callback").await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn id_token_without_email_is_rejected() {
        let server = MockServer::start().await;
        let key = generate_signing_jwk();
        mount_discovery(&server).await;
        mount_keys(&server, &key).await;
        mount_token(&server, id_token(&server, &key, "client-id", "")).await;

        let client = ReqwestOidcFactory::new().unwrap().client_for(&provider(&server, ProviderKind::Oidc));
        let err = client.exchange_code("code", "http://localhost/callback").await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unexpired_access_token_is_not_refreshed() {
        let server = MockServer::start().await;
        let client = ReqwestOidcFactory::new().unwrap().client_for(&provider(&server, ProviderKind::Oidc));
        let expiry = Utc::now() + Duration::hours(1);
        let (token, exp) = client
            .refresh_access_token(&provider_user("current", "ref", Some(expiry)))
            .await
            .unwrap();
        assert_eq!(token, "current");
        assert_eq!(exp, Some(expiry));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_access_token_is_refreshed() {
        let server = MockServer::start().await;
        mount_discovery(&server).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 600,
            })))
            .mount(&server)
            .await;

        let client = ReqwestOidcFactory::new().unwrap().client_for(&provider(&server, ProviderKind::Oidc));
        let (token, exp) = client
            .refresh_access_token(&provider_user("old", "ref", Some(Utc::now() - Duration::minutes(1))))
            .await
            .unwrap();
        assert_eq!(token, "fresh");
        assert!(exp.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn revoked_refresh_token_is_forbidden() {
        let server = MockServer::start().await;
        mount_discovery(&server).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
            })))
            .mount(&server)
            .await;

        let client = ReqwestOidcFactory::new().unwrap().client_for(&provider(&server, ProviderKind::Oidc));
        let err = client
            .refresh_access_token(&provider_user("old", "ref", Some(Utc::now() - Duration::minutes(1))))
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn user_info_returns_groups() {
        let server = MockServer::start().await;
        mount_discovery(&server).await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("authorization", "Bearer acc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "email": "joe@example.com",
                "groups": ["Everyone", "developers"],
            })))
            .mount(&server)
            .await;

        let client = ReqwestOidcFactory::new().unwrap().client_for(&provider(&server, ProviderKind::Okta));
        let info = client.user_info(&provider_user("acc", "", None)).await.unwrap();
        assert_eq!(info.groups, vec!["Everyone".to_string(), "developers".to_string()]);
    }

    #[tokio::test]
    async fn rejected_user_info_is_forbidden() {
        let server = MockServer::start().await;
        mount_discovery(&server).await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = ReqwestOidcFactory::new().unwrap().client_for(&provider(&server, ProviderKind::Oidc));
        let err = client.user_info(&provider_user("acc", "", None)).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn azure_group_listing_forbidden_clears_groups() {
        let server = MockServer::start().await;
        mount_discovery(&server).await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "email": "joe@example.com",
                "groups": ["stale"],
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/memberOf"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let factory = ReqwestOidcFactory::new()
            .unwrap()
            .with_graph_url(format!("{}/graph/memberOf", server.uri()));
        let client = factory.client_for(&provider(&server, ProviderKind::Azure));
        let info = client.user_info(&provider_user("acc", "", None)).await.unwrap();
        assert!(info.groups.is_empty());
    }

    #[tokio::test]
    async fn azure_groups_come_from_graph() {
        let server = MockServer::start().await;
        mount_discovery(&server).await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "Joe",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/memberOf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    {"@odata.type": "#microsoft.graph.group", "displayName": "admins"},
                    {"@odata.type": "#microsoft.graph.directoryRole", "displayName": "Global Reader"},
                ],
            })))
            .mount(&server)
            .await;

        let factory = ReqwestOidcFactory::new()
            .unwrap()
            .with_graph_url(format!("{}/graph/memberOf", server.uri()));
        let client = factory.client_for(&provider(&server, ProviderKind::Azure));
        let info = client.user_info(&provider_user("acc", "", None)).await.unwrap();
        assert_eq!(info.groups, vec!["admins".to_string()]);
    }
}
