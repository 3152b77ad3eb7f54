mod common;

use std::time::Duration;

use access_service::data;
use access_service::db::{Channel, TxOptions};
use access_service::models::{Destination, Grant, Organization};
use common::TestApp;
use serde_json::json;
use service_core::api::{CreateDestinationRequest, CreateGrantResponse, DestinationConnection, Grant as ApiGrant, ListResponse};
use service_core::error::AppError;
use service_core::subject::Subject;
use service_core::uid::Id;
use tokio::time::Instant;

fn destination_request(name: &str) -> CreateDestinationRequest {
    CreateDestinationRequest {
        unique_id: format!("{}-unique", name),
        name: name.to_string(),
        connection: DestinationConnection {
            url: "https://10.0.0.1:443".to_string(),
            ca: String::new(),
        },
        ..CreateDestinationRequest::default()
    }
}

async fn insert_destination(app: &TestApp, org_id: Id, name: &str) -> Destination {
    let mut tx = app.db.begin_for_org(org_id, TxOptions::read_write()).await.unwrap();
    let mut destination = Destination::from_request(org_id, &destination_request(name));
    data::destinations::create_destination(&mut tx, &mut destination).await.unwrap();
    tx.commit().await.unwrap();
    destination
}

async fn insert_grant(app: &TestApp, org_id: Id, resource: &str) {
    let mut tx = app.db.begin_for_org(org_id, TxOptions::read_write()).await.unwrap();
    let mut grant = Grant::new(Subject::User(Id::generate()), "view", resource, Id::default());
    data::grants::create_grant(&mut tx, &mut grant).await.unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn duplicate_grant_returns_the_existing_one() {
    let app = TestApp::spawn().await;
    let joe = app.create_user("joe@example.com", &[]).await;
    let body = json!({"subject": format!("u:{}", joe.identity.id), "privilege": "view", "resource": "k8s.prod"});

    let response = app
        .client
        .post(app.url("/api/grants"))
        .bearer_auth(&app.admin.access_key)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let first: CreateGrantResponse = response.json().await.unwrap();
    assert!(first.was_created);

    let response = app
        .client
        .post(app.url("/api/grants"))
        .bearer_auth(&app.admin.access_key)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let second: CreateGrantResponse = response.json().await.unwrap();
    assert!(!second.was_created);
    assert_eq!(second.grant.id, first.grant.id);

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn users_without_a_role_see_only_their_own_grants() {
    let app = TestApp::spawn().await;
    let joe = app.create_user("joe@example.com", &[]).await;

    let response = app
        .client
        .get(app.url("/api/grants"))
        .bearer_auth(&joe.access_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("requires role"));

    let response = app
        .client
        .get(app.url(&format!("/api/grants?subject=u:{}", joe.identity.id)))
        .bearer_auth(&joe.access_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = app
        .client
        .post(app.url("/api/grants"))
        .bearer_auth(&joe.access_key)
        .json(&json!({"subject": format!("u:{}", joe.identity.id), "privilege": "admin", "resource": "infra"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn removing_the_last_admin_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(app.url(&format!("/api/grants?subject=u:{}&privilege=admin", app.admin.identity.id)))
        .bearer_auth(&app.admin.access_key)
        .send()
        .await
        .unwrap();
    let grants: ListResponse<ApiGrant> = response.json().await.unwrap();
    let admin_grant = &grants.items[0];

    let response = app
        .client
        .delete(app.url(&format!("/api/grants/{}", admin_grant.id)))
        .bearer_auth(&app.admin.access_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn blocking_list_waits_for_destination_changes() {
    let app = TestApp::spawn_with(|config| config.timeouts.blocking_request = Duration::from_secs(2)).await;
    let connector_key = app.connector_key().await;
    insert_destination(&app, app.org.id, "k8s").await;

    let response = app
        .client
        .get(app.url("/api/grants?destination=k8s"))
        .bearer_auth(&connector_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let initial: ListResponse<ApiGrant> = response.json().await.unwrap();
    let index = initial.last_update_index.index;

    // nothing changes: the long-poll ends with 304
    let response = app
        .client
        .get(app.url(&format!("/api/grants?destination=k8s&lastUpdateIndex={}", index)))
        .bearer_auth(&connector_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 304);

    let poll = {
        let client = app.client.clone();
        let url = app.url(&format!("/api/grants?destination=k8s&lastUpdateIndex={}", index));
        let key = connector_key.clone();
        tokio::spawn(async move { client.get(url).bearer_auth(key).send().await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    insert_grant(&app, app.org.id, "k8s.kube-system").await;

    let response = poll.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    let changed: ListResponse<ApiGrant> = response.json().await.unwrap();
    assert!(changed.last_update_index.index > index);
    assert!(changed.items.iter().any(|g| g.resource == "k8s.kube-system"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn grant_notifications_stay_inside_their_organization() {
    let app = TestApp::spawn().await;
    let destination = insert_destination(&app, app.org.id, "shared-name").await;

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
    insert_destination(&app, other.id, "shared-name").await;

    let channel = Channel::GrantsByDestination {
        org_id: app.org.id,
        destination_id: destination.id,
    };
    let mut listener = app.db.listen_for_notify(&[channel]).await.unwrap();

    insert_grant(&app, other.id, "shared-name").await;
    let err = listener
        .wait_for_notification(Instant::now() + Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotModified));

    insert_grant(&app, app.org.id, "shared-name.default").await;
    listener
        .wait_for_notification(Instant::now() + Duration::from_secs(5))
        .await
        .unwrap();

    listener.release().await.unwrap();
    app.cleanup().await;
}
