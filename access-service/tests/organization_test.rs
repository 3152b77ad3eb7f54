mod common;

use access_service::data;
use access_service::data::grants::ListGrantsOptions;
use access_service::db::TxOptions;
use access_service::models::{ProviderKind, CONNECTOR_IDENTITY_NAME, CONNECTOR_ROLE, INFRA_RESOURCE, SUPPORT_ADMIN_ROLE};
use common::TestApp;
use serde_json::json;
use service_core::api::Organization;
use service_core::subject::Subject;

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn new_organization_gets_its_built_in_records() {
    let app = TestApp::spawn().await;
    let support = app.create_user("support@example.com", &[SUPPORT_ADMIN_ROLE]).await;

    let response = app
        .client
        .post(app.url("/api/organizations"))
        .bearer_auth(&support.access_key)
        .json(&json!({"name": "Acme Corp"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let org: Organization = response.json().await.unwrap();
    assert!(!org.domain.is_empty());

    let mut tx = app.db.begin_for_org(org.id, TxOptions::read_only()).await.unwrap();

    let infra = data::providers::get_infra_provider(&mut tx).await.unwrap();
    assert_eq!(infra.organization_id, org.id);
    assert_eq!(infra.kind, ProviderKind::Infra.to_string());

    let connector = data::identities::get_identity_by_name(&mut tx, CONNECTOR_IDENTITY_NAME)
        .await
        .unwrap();
    assert!(connector.is_connector());

    let grants = data::grants::list_grants(
        &mut tx,
        &ListGrantsOptions {
            by_subject: Some(Subject::User(connector.id)),
            ..ListGrantsOptions::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].privilege, CONNECTOR_ROLE);
    assert_eq!(grants[0].resource, INFRA_RESOURCE);

    let settings = data::settings::get_settings(&mut tx).await.unwrap();
    assert!(!settings.public_jwk.is_empty());
    settings.verification_key().unwrap();
    settings.signing_key().unwrap();

    // the caller's organization keeps its own signing key
    tx.rollback().await.unwrap();
    let mut tx = app.db.begin_for_org(app.org.id, TxOptions::read_only()).await.unwrap();
    let own = data::settings::get_settings(&mut tx).await.unwrap();
    assert_ne!(own.public_jwk, settings.public_jwk);
    tx.rollback().await.unwrap();

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (TEST_DATABASE_URL)"]
async fn only_support_admins_create_organizations() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(app.url("/api/organizations"))
        .bearer_auth(&app.admin.access_key)
        .json(&json!({"name": "Acme Corp"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    app.cleanup().await;
}
