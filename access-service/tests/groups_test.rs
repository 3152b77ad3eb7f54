mod common;

use std::time::Duration;

use access_service::data;
use access_service::data::access_keys::ListAccessKeysOptions;
use access_service::data::grants::ListGrantsOptions;
use access_service::db::{Channel, TxOptions};
use access_service::models::{Grant, ProviderUser, INFRA_RESOURCE};
use common::TestApp;
use serde_json::json;
use service_core::api::Group;
use service_core::subject::Subject;
use service_core::uid::Id;
use tokio::time::Instant;

async fn create_group(app: &TestApp, name: &str) -> Group {
    let response = app
        .client
        .post(app.url("/api/groups"))
        .bearer_auth(&app.admin.access_key)
        .json(&json!({"name": name}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    response.json().await.unwrap()
}

async fn update_users(app: &TestApp, group_id: Id, body: serde_json::Value) {
    let response = app
        .client
        .patch(app.url(&format!("/api/groups/{}/users", group_id)))
        .bearer_auth(&app.admin.access_key)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
}

async fn get_group(app: &TestApp, group_id: Id) -> Group {
    let response = app
        .client
        .get(app.url(&format!("/api/groups/{}", group_id)))
        .bearer_auth(&app.admin.access_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    response.json().await.unwrap()
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn adding_a_member_twice_counts_once() {
    let app = TestApp::spawn().await;
    let joe = app.create_user("joe@example.com", &[]).await;
    let group = create_group(&app, "ops").await;

    update_users(&app, group.id, json!({"usersToAdd": [joe.identity.id, joe.identity.id]})).await;
    update_users(&app, group.id, json!({"usersToAdd": [joe.identity.id]})).await;
    assert_eq!(get_group(&app, group.id).await.total_users, 1);

    update_users(&app, group.id, json!({"usersToRemove": [joe.identity.id]})).await;
    assert_eq!(get_group(&app, group.id).await.total_users, 0);

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn membership_changes_wake_group_listeners() {
    let app = TestApp::spawn().await;
    let joe = app.create_user("joe@example.com", &[]).await;
    let group = create_group(&app, "ops").await;

    let channel = Channel::GroupMembers {
        org_id: app.org.id,
        group_id: group.id,
    };
    let mut listener = app.db.listen_for_notify(&[channel]).await.unwrap();

    update_users(&app, group.id, json!({"usersToAdd": [joe.identity.id]})).await;
    listener
        .wait_for_notification(Instant::now() + Duration::from_secs(5))
        .await
        .unwrap();

    listener.release().await.unwrap();
    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn deleting_a_user_removes_what_hangs_off_it() {
    let app = TestApp::spawn().await;
    let joe = app.create_user("joe@example.com", &[]).await;
    let group = create_group(&app, "ops").await;
    update_users(&app, group.id, json!({"usersToAdd": [joe.identity.id]})).await;

    let mut tx = app.db.begin_for_org(app.org.id, TxOptions::read_write()).await.unwrap();
    let mut grant = Grant::new(Subject::User(joe.identity.id), "view", "k8s.prod", Id::default());
    data::grants::create_grant(&mut tx, &mut grant).await.unwrap();
    let infra = data::providers::get_infra_provider(&mut tx).await.unwrap();
    let mut provider_user = ProviderUser {
        identity_id: joe.identity.id,
        provider_id: infra.id,
        organization_id: app.org.id,
        email: joe.identity.name.clone(),
        groups: Vec::new(),
        last_update: chrono::Utc::now(),
        redirect_url: String::new(),
        access_token: String::new(),
        refresh_token: String::new(),
        expires_at: None,
        active: true,
    };
    data::providers::create_provider_user(&mut tx, &mut provider_user).await.unwrap();
    tx.commit().await.unwrap();

    let response = app
        .client
        .delete(app.url(&format!("/api/users/{}", joe.identity.id)))
        .bearer_auth(&app.admin.access_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    // the deleted user's key stops working
    let response = app
        .client
        .get(app.url(&format!("/api/users/{}", joe.identity.id)))
        .bearer_auth(&joe.access_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = app
        .client
        .post(app.url("/api/login"))
        .json(&json!({"passwordCredentials": {"name": "joe@example.com", "password": "password"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let mut tx = app.db.begin_for_org(app.org.id, TxOptions::read_only()).await.unwrap();
    let grants = data::grants::list_grants(
        &mut tx,
        &ListGrantsOptions {
            by_subject: Some(Subject::User(joe.identity.id)),
            ..ListGrantsOptions::default()
        },
    )
    .await
    .unwrap();
    assert!(grants.is_empty());

    let keys = data::access_keys::list_access_keys(
        &mut tx,
        &ListAccessKeysOptions {
            by_issued_for: Some(joe.identity.id),
            by_name: None,
            include_expired: true,
        },
    )
    .await
    .unwrap();
    assert!(keys.is_empty());

    let err = data::providers::get_provider_user(&mut tx, infra.id, joe.identity.id)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let groups = data::groups::group_ids_for_identity(&mut tx, joe.identity.id).await.unwrap();
    assert!(groups.is_empty());

    // grants on other resources of the organization are untouched
    let admin_grants = data::grants::list_grants(
        &mut tx,
        &ListGrantsOptions {
            by_subject: Some(Subject::User(app.admin.identity.id)),
            by_resource: Some(INFRA_RESOURCE.to_string()),
            ..ListGrantsOptions::default()
        },
    )
    .await
    .unwrap();
    assert!(!admin_grants.is_empty());
    tx.rollback().await.unwrap();

    app.cleanup().await;
}
