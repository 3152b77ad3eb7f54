mod common;

use std::sync::Arc;

use access_service::models::{Provider, ProviderUser};
use access_service::services::{OidcClient, OidcClientFactory, ProviderTokens, UserInfo};
use chrono::{DateTime, Utc};
use common::TestApp;
use serde_json::json;
use service_core::api::{Group, ListResponse, LoginResponse, Provider as ApiProvider, User};
use service_core::error::AppError;

/// An identity provider that knows one user.
struct FakeIdp {
    email: String,
    groups: Vec<String>,
}

#[async_trait::async_trait]
impl OidcClient for FakeIdp {
    async fn exchange_code(&self, code: &str, _redirect_url: &str) -> Result<ProviderTokens, AppError> {
        if code != "good-code" {
            return Err(AppError::Unauthorized(anyhow::anyhow!("bad code")));
        }
        Ok(ProviderTokens {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            email: self.email.clone(),
        })
    }

    async fn refresh_access_token(
        &self,
        user: &ProviderUser,
    ) -> Result<(String, Option<DateTime<Utc>>), AppError> {
        Ok((user.access_token.clone(), user.expires_at))
    }

    async fn user_info(&self, _user: &ProviderUser) -> Result<UserInfo, AppError> {
        Ok(UserInfo {
            email: self.email.clone(),
            name: String::new(),
            groups: self.groups.clone(),
        })
    }
}

struct FakeIdpFactory(Arc<FakeIdp>);

impl OidcClientFactory for FakeIdpFactory {
    fn client_for(&self, _provider: &Provider) -> Arc<dyn OidcClient> {
        self.0.clone()
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn first_oidc_login_creates_user_and_groups() {
    let idp = FakeIdp {
        email: "newusernewgroups@example.com".to_string(),
        groups: vec!["Everyone".to_string(), "developers".to_string()],
    };
    let app = TestApp::spawn_with_oidc(Arc::new(FakeIdpFactory(Arc::new(idp)))).await;

    let response = app
        .client
        .post(app.url("/api/providers"))
        .bearer_auth(&app.admin.access_key)
        .json(&json!({
            "name": "okta",
            "kind": "okta",
            "url": "example.okta.com",
            "clientID": "client",
            "clientSecret": "secret",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let provider: ApiProvider = response.json().await.unwrap();

    let response = app
        .client
        .post(app.url("/api/login"))
        .json(&json!({"oidc": {"providerID": provider.id, "redirectURL": "http://localhost:8301", "code": "good-code"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let login: LoginResponse = response.json().await.unwrap();
    assert_eq!(login.name, "newusernewgroups@example.com");

    let response = app
        .client
        .get(app.url("/api/users?name=newusernewgroups@example.com"))
        .bearer_auth(&app.admin.access_key)
        .send()
        .await
        .unwrap();
    let users: ListResponse<User> = response.json().await.unwrap();
    assert_eq!(users.count, 1);
    assert!(users.items[0].provider_names.iter().any(|n| n == "okta"));

    let response = app
        .client
        .get(app.url(&format!("/api/groups?userID={}", login.user_id)))
        .bearer_auth(&login.access_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let groups: ListResponse<Group> = response.json().await.unwrap();
    let mut names: Vec<_> = groups.items.iter().map(|g| g.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, ["Everyone", "developers"]);

    // a second login changes nothing
    let response = app
        .client
        .post(app.url("/api/login"))
        .json(&json!({"oidc": {"providerID": provider.id, "redirectURL": "http://localhost:8301", "code": "good-code"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let response = app
        .client
        .get(app.url("/api/groups"))
        .bearer_auth(&app.admin.access_key)
        .send()
        .await
        .unwrap();
    let groups: ListResponse<Group> = response.json().await.unwrap();
    assert_eq!(groups.count, 2);

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn rejected_code_creates_nothing() {
    let idp = FakeIdp {
        email: "someone@example.com".to_string(),
        groups: Vec::new(),
    };
    let app = TestApp::spawn_with_oidc(Arc::new(FakeIdpFactory(Arc::new(idp)))).await;

    let response = app
        .client
        .post(app.url("/api/providers"))
        .bearer_auth(&app.admin.access_key)
        .json(&json!({"name": "oidc", "url": "idp.example.com", "clientID": "c", "clientSecret": "s"}))
        .send()
        .await
        .unwrap();
    let provider: ApiProvider = response.json().await.unwrap();

    let response = app
        .client
        .post(app.url("/api/login"))
        .json(&json!({"oidc": {"providerID": provider.id, "redirectURL": "http://localhost", "code": "bad"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = app
        .client
        .get(app.url("/api/users?name=someone@example.com"))
        .bearer_auth(&app.admin.access_key)
        .send()
        .await
        .unwrap();
    let users: ListResponse<User> = response.json().await.unwrap();
    assert_eq!(users.count, 0);

    app.cleanup().await;
}
