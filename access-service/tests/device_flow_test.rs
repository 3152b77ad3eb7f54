mod common;

use access_service::data;
use access_service::db::TxOptions;
use access_service::models::Organization;
use common::TestApp;
use serde_json::json;
use service_core::api::{DeviceFlowResponse, DeviceFlowStatus, DevicePollResponse, LoginResponse};
use service_core::uid::Id;

async fn start(app: &TestApp) -> DeviceFlowResponse {
    let response = app.client.post(app.url("/api/device")).send().await.unwrap();
    assert_eq!(response.status(), 201);
    response.json().await.unwrap()
}

async fn poll(app: &TestApp, device_code: &str) -> reqwest::Response {
    app.client
        .post(app.url("/api/device/status"))
        .json(&json!({"deviceCode": device_code}))
        .send()
        .await
        .unwrap()
}

async fn approve(app: &TestApp, access_key: &str, user_code: &str) -> reqwest::Response {
    app.client
        .post(app.url("/api/device/approve"))
        .bearer_auth(access_key)
        .json(&json!({"userCode": user_code}))
        .send()
        .await
        .unwrap()
}

async fn password_login(app: &TestApp, name: &str) -> LoginResponse {
    let response = app
        .client
        .post(app.url("/api/login"))
        .json(&json!({"passwordCredentials": {"name": name, "password": "password"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    response.json().await.unwrap()
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn device_is_handed_a_key_once_after_approval() {
    let app = TestApp::spawn().await;
    let joe = app.create_user("joe@example.com", &[]).await;

    let flow = start(&app).await;
    assert_eq!(flow.user_code.len(), 8);
    assert_eq!(flow.device_code.len(), 38);
    assert!(flow.verification_uri.ends_with("/device"));

    let response = poll(&app, &flow.device_code).await;
    assert_eq!(response.status(), 200);
    let status: DevicePollResponse = response.json().await.unwrap();
    assert_eq!(status.status, DeviceFlowStatus::Pending);
    assert!(status.login.is_none());

    let login = password_login(&app, "joe@example.com").await;
    assert_eq!(approve(&app, &login.access_key, &flow.user_code).await.status(), 204);
    assert_eq!(approve(&app, &login.access_key, &flow.user_code).await.status(), 400);

    let response = poll(&app, &flow.device_code).await;
    assert_eq!(response.status(), 200);
    let status: DevicePollResponse = response.json().await.unwrap();
    assert_eq!(status.status, DeviceFlowStatus::Confirmed);
    let device_login = status.login.unwrap();
    assert_eq!(device_login.user_id, joe.identity.id);
    assert_ne!(device_login.access_key, login.access_key);

    let response = app
        .client
        .get(app.url(&format!("/api/users/{}", joe.identity.id)))
        .bearer_auth(&device_login.access_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // the request row is gone once the key was handed over
    assert_eq!(poll(&app, &flow.device_code).await.status(), 404);

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn expired_requests_cannot_be_approved() {
    let app = TestApp::spawn().await;
    app.create_user("joe@example.com", &[]).await;
    let flow = start(&app).await;

    let mut tx = app.db.begin_for_org(app.org.id, TxOptions::read_write()).await.unwrap();
    sqlx::query("UPDATE device_flow_auth_requests SET expires_at = $1 WHERE device_code = $2")
        .bind(chrono::Utc::now() - chrono::Duration::minutes(1))
        .bind(&flow.device_code)
        .execute(tx.conn())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let response = poll(&app, &flow.device_code).await;
    assert_eq!(response.status(), 200);
    let status: DevicePollResponse = response.json().await.unwrap();
    assert_eq!(status.status, DeviceFlowStatus::Expired);
    assert!(status.login.is_none());

    let login = password_login(&app, "joe@example.com").await;
    assert_eq!(approve(&app, &login.access_key, &flow.user_code).await.status(), 400);

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn delete_is_confined_to_the_transaction_org() {
    let app = TestApp::spawn().await;
    let flow = start(&app).await;

    let mut other = Organization {
        id: Id::generate(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        name: "other".to_string(),
        domain: String::new(),
        created_by: Id::default(),
    };
    let mut tx = app.db.begin(TxOptions::read_write()).await.unwrap();
    data::organizations::create_organization(&mut tx, &mut other).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = app.db.begin_for_org(app.org.id, TxOptions::read_only()).await.unwrap();
    let request = data::device_flow::get_by_device_code(&mut tx, &flow.device_code).await.unwrap();
    tx.rollback().await.unwrap();

    let mut tx = app.db.begin_for_org(other.id, TxOptions::read_write()).await.unwrap();
    data::device_flow::delete(&mut tx, request.id).await.unwrap();
    tx.commit().await.unwrap();

    let response = poll(&app, &flow.device_code).await;
    assert_eq!(response.status(), 200);
    let status: DevicePollResponse = response.json().await.unwrap();
    assert_eq!(status.status, DeviceFlowStatus::Pending);

    app.cleanup().await;
}
