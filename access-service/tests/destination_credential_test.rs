mod common;

use std::time::Duration;

use access_service::data;
use access_service::db::TxOptions;
use access_service::jobs::Job;
use chrono::Utc;
use common::TestApp;
use serde_json::json;
use service_core::api::{
    AccessClient, AnswerDestinationCredentialRequest, CreateDestinationRequest, DestinationConnection,
    DestinationCredential, ListDestinationCredentialsQuery,
};
use service_core::error::AppError;

async fn register_destination(client: &AccessClient, name: &str) {
    client
        .create_destination(&CreateDestinationRequest {
            unique_id: format!("{}-unique", name),
            name: name.to_string(),
            connection: DestinationConnection {
                url: "https://10.0.0.1:443".to_string(),
                ca: String::new(),
            },
            ..CreateDestinationRequest::default()
        })
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn connector_answer_unblocks_the_user() {
    let app = TestApp::spawn().await;
    let joe = app.create_user("joe@example.com", &[]).await;
    let connector = AccessClient::new(&app.address, &app.connector_key().await)
        .unwrap()
        .for_destination("k8s", "0.1.0")
        .unwrap();
    register_destination(&connector, "k8s").await;

    let response = app
        .client
        .post(app.url("/api/grants"))
        .bearer_auth(&app.admin.access_key)
        .json(&json!({"subject": format!("u:{}", joe.identity.id), "privilege": "view", "resource": "k8s.prod"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let user = AccessClient::new(&app.address, &joe.access_key).unwrap();
    let waiting = tokio::spawn(async move { user.create_destination_credential("k8s").await });

    let open = connector
        .list_destination_credentials(&ListDestinationCredentialsQuery {
            destination: "k8s".to_string(),
            last_update_index: 0,
        })
        .await
        .unwrap();
    assert_eq!(open.items.len(), 1);
    let request = &open.items[0];
    assert_eq!(request.user_id, joe.identity.id);
    assert!(!request.answered);

    let expires = Utc::now() + chrono::Duration::minutes(5);
    connector
        .answer_destination_credential(&AnswerDestinationCredentialRequest {
            id: request.id,
            organization_id: request.organization_id,
            bearer_token: "foo.bar".to_string(),
            credential_expires_at: expires,
        })
        .await
        .unwrap();

    // a second answer for the same request changes nothing
    connector
        .answer_destination_credential(&AnswerDestinationCredentialRequest {
            id: request.id,
            organization_id: request.organization_id,
            bearer_token: "evil.token".to_string(),
            credential_expires_at: expires + chrono::Duration::hours(1),
        })
        .await
        .unwrap();

    let credential: DestinationCredential = tokio::time::timeout(Duration::from_secs(10), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(credential.answered);
    assert_eq!(credential.bearer_token.as_deref(), Some("foo.bar"));
    assert!(credential.credential_expires_at.is_some());

    let mut tx = app.db.begin_for_org(app.org.id, TxOptions::read_only()).await.unwrap();
    let stored: Option<String> =
        sqlx::query_scalar("SELECT bearer_token FROM destination_credentials WHERE id = $1")
            .bind(request.id)
            .fetch_one(tx.conn())
            .await
            .unwrap();
    let stored = stored.expect("answered row has a bearer token");
    assert!(!stored.contains("foo.bar"));
    assert!(!stored.contains("evil.token"));

    let reread = data::destination_credentials::get_destination_credential(&mut tx, request.id)
        .await
        .unwrap();
    assert_eq!(reread.bearer_token.as_deref(), Some("foo.bar"));
    tx.rollback().await.unwrap();

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn users_without_a_grant_get_unauthorized() {
    let app = TestApp::spawn().await;
    let joe = app.create_user("joe@example.com", &[]).await;
    let connector = AccessClient::new(&app.address, &app.connector_key().await).unwrap();
    register_destination(&connector, "k8s").await;

    let user = AccessClient::new(&app.address, &joe.access_key).unwrap();
    let err = user.create_destination_credential("k8s").await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    // an unknown destination looks the same as a known one
    let err = user.create_destination_credential("no-such-cluster").await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn unanswered_request_times_out() {
    let app = TestApp::spawn_with(|config| config.timeouts.blocking_request = Duration::from_secs(1)).await;
    let joe = app.create_user("joe@example.com", &[]).await;
    let connector = AccessClient::new(&app.address, &app.connector_key().await).unwrap();
    register_destination(&connector, "k8s").await;

    app.client
        .post(app.url("/api/grants"))
        .bearer_auth(&app.admin.access_key)
        .json(&json!({"subject": format!("u:{}", joe.identity.id), "privilege": "view", "resource": "k8s"}))
        .send()
        .await
        .unwrap();

    let user = AccessClient::new(&app.address, &joe.access_key).unwrap();
    let err = user.create_destination_credential("k8s").await.unwrap_err();
    assert!(matches!(err, AppError::Timeout(_)));

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn expired_requests_are_removed_by_maintenance() {
    let app = TestApp::spawn().await;
    let joe = app.create_user("joe@example.com", &[]).await;
    let connector = AccessClient::new(&app.address, &app.connector_key().await).unwrap();
    register_destination(&connector, "k8s").await;

    let mut tx = app.db.begin_for_org(app.org.id, TxOptions::read_write()).await.unwrap();
    let destination = data::destinations::get_destination_by_name(&mut tx, "k8s").await.unwrap();
    let cred = data::destination_credentials::create_destination_credential(&mut tx, joe.identity.id, destination.id)
        .await
        .unwrap();
    sqlx::query("UPDATE destination_credentials SET request_expires_at = $2 WHERE id = $1")
        .bind(cred.id)
        .bind(Utc::now() - chrono::Duration::seconds(1))
        .execute(tx.conn())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let deleted = Job::RemoveExpiredDestinationCredentials.run(&app.db).await.unwrap();
    assert_eq!(deleted, 1);

    let mut tx = app.db.begin_for_org(app.org.id, TxOptions::read_only()).await.unwrap();
    let err = data::destination_credentials::get_destination_credential(&mut tx, cred.id)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    tx.rollback().await.unwrap();

    app.cleanup().await;
}
