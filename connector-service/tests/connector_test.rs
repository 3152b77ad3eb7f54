//! End-to-end runs of the connector loops against a fake server.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{destination_json, eventually, grant_json, init_test_tracing, list_json};
use connector_service::config::ConnectorConfig;
use connector_service::error::ConnectorError;
use connector_service::startup::{Application, Parts};
use connector_service::sync::{DestinationSource, GrantReconciler};
use service_core::api::{AccessClient, CreateDestinationRequest, DestinationConnection, DestinationKind, Grant};
use service_core::error::AppError;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingDestination {
    applied: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl GrantReconciler for RecordingDestination {
    async fn reconcile(&self, _api: &AccessClient, grants: &[Grant]) -> Result<(), ConnectorError> {
        let resources = grants.iter().map(|g| g.resource.clone()).collect();
        self.applied.lock().unwrap().push(resources);
        Ok(())
    }
}

#[async_trait]
impl DestinationSource for RecordingDestination {
    async fn describe(&self) -> Result<CreateDestinationRequest, ConnectorError> {
        Ok(CreateDestinationRequest {
            unique_id: "unique".into(),
            name: "prod".into(),
            kind: DestinationKind::Ssh,
            connection: DestinationConnection {
                url: "127.0.0.1:22".into(),
                ca: "ssh-ed25519 AAAA".into(),
            },
            ..Default::default()
        })
    }
}

async fn mount_registration(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/destinations"))
        .and(query_param("uniqueID", "unique"))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(vec![], 0)))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/destinations"))
        .and(header("Infra-Destination-Name", "prod"))
        .respond_with(ResponseTemplate::new(201).set_body_json(destination_json("7", "prod", "ssh")))
        .expect(1)
        .mount(server)
        .await;
}

fn parts(destination: Arc<RecordingDestination>) -> Parts {
    Parts {
        reconciler: destination.clone(),
        source: destination,
        issuer: None,
        proxy: None,
    }
}

#[tokio::test]
async fn registers_then_applies_grants_until_cancelled() {
    init_test_tracing();
    let server = MockServer::start().await;
    mount_registration(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/grants"))
        .and(query_param("destination", "prod"))
        .and(query_param("lastUpdateIndex", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(
            vec![grant_json("4", "u:3", "connect", "prod")],
            5,
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/grants"))
        .and(query_param("lastUpdateIndex", "5"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let config = ConnectorConfig::for_tests(&server.uri(), DestinationKind::Ssh);
    let destination = Arc::new(RecordingDestination::default());
    let app = Application::build_with_parts(config, parts(destination.clone()))
        .await
        .unwrap();
    let status_port = app.status_port();

    let cancel = CancellationToken::new();
    let run = tokio::spawn(app.run_until_stopped(cancel.clone()));

    let applied = destination.clone();
    assert!(
        eventually(move || {
            let applied = applied.clone();
            async move { !applied.applied.lock().unwrap().is_empty() }
        })
        .await
    );
    assert_eq!(destination.applied.lock().unwrap()[0], vec!["prod".to_string()]);

    let health = reqwest::get(format!("http://127.0.0.1:{}/healthz", status_port))
        .await
        .unwrap();
    assert!(health.status().is_success());
    let metrics_url = format!("http://127.0.0.1:{}/metrics", status_port);
    assert!(
        eventually(move || {
            let url = metrics_url.clone();
            async move {
                let body = reqwest::get(url).await.unwrap().text().await.unwrap();
                body.contains("connector_sync_total")
            }
        })
        .await
    );

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), run).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn revoked_access_key_stops_every_loop() {
    init_test_tracing();
    let server = MockServer::start().await;
    mount_registration(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/grants"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "access key revoked"})))
        .mount(&server)
        .await;

    let config = ConnectorConfig::for_tests(&server.uri(), DestinationKind::Ssh);
    let app = Application::build_with_parts(config, parts(Arc::new(RecordingDestination::default())))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), app.run_until_stopped(CancellationToken::new()))
        .await
        .unwrap();
    assert!(matches!(result, Err(ConnectorError::Api(AppError::Unauthorized(_)))));
}

#[tokio::test]
async fn rejected_registration_fails_fast() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/destinations"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "unauthorized"})))
        .mount(&server)
        .await;

    let config = ConnectorConfig::for_tests(&server.uri(), DestinationKind::Ssh);
    let app = Application::build_with_parts(config, parts(Arc::new(RecordingDestination::default())))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), app.run_until_stopped(CancellationToken::new()))
        .await
        .unwrap();
    assert!(result.is_err());
}
