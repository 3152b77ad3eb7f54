//! The connector's loops: grant sync, destination sync and credential answers.
//!
//! Each loop talks to the server through [`AccessClient`] and hands the
//! destination-specific work to one of the traits below, so the Kubernetes
//! and SSH connectors share the same scheduling and retry behavior.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use service_core::api::{
    AccessClient, AnswerDestinationCredentialRequest, CreateDestinationRequest, DestinationCredential, Grant,
    ListDestinationCredentialsQuery, ListDestinationsQuery, ListGrantsQuery, User,
};
use service_core::error::AppError;
use service_core::uid::Id;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ConnectorError;
use crate::metrics::{record_credential, record_sync};

/// Pause after a failed credential poll. Short, since users are waiting.
const CREDENTIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Applies a grant snapshot to the destination.
#[async_trait]
pub trait GrantReconciler: Send + Sync {
    async fn reconcile(&self, api: &AccessClient, grants: &[Grant]) -> Result<(), ConnectorError>;
}

/// Describes the destination as it should be registered right now.
#[async_trait]
pub trait DestinationSource: Send + Sync {
    async fn describe(&self) -> Result<CreateDestinationRequest, ConnectorError>;
}

/// Mints a destination-local credential for a user.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, user: &User) -> Result<(String, DateTime<Utc>), ConnectorError>;
}

/// Backoff between grant syncs: 2s growing by 1.5x to one minute, with 20%
/// jitter, never giving up.
pub fn grant_backoff() -> ExponentialBackoff {
    let initial = Duration::from_secs(2);
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        randomization_factor: 0.2,
        multiplier: 1.5,
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantSyncOutcome {
    /// Grants were applied; the next poll starts from this index.
    Applied(i64),
    NotModified,
}

/// One grant sync pass: poll from `last_index` and reconcile what comes back.
/// The index only moves once the whole snapshot has been applied.
#[instrument(skip(api, reconciler))]
pub async fn sync_grants_once(
    api: &AccessClient,
    destination: &str,
    reconciler: &dyn GrantReconciler,
    last_index: i64,
) -> Result<GrantSyncOutcome, ConnectorError> {
    let grants = match api
        .list_grants(&ListGrantsQuery::for_destination(destination, last_index))
        .await
    {
        Ok(grants) => grants,
        Err(AppError::NotModified) => {
            info!(update_index = last_index, "No updated grants from server");
            return Ok(GrantSyncOutcome::NotModified);
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        update_index = grants.last_update_index.index,
        grants = grants.items.len(),
        "Received grants from server"
    );
    reconciler.reconcile(api, &grants.items).await?;
    Ok(GrantSyncOutcome::Applied(grants.last_update_index.index))
}

/// Keep the destination in step with its grants until cancelled. Transient
/// failures are retried forever; a rejected access key ends the loop.
pub async fn run_grant_sync(
    api: AccessClient,
    destination: String,
    reconciler: Arc<dyn GrantReconciler>,
    mut backoff: ExponentialBackoff,
    cancel: CancellationToken,
) -> Result<(), ConnectorError> {
    let mut last_index = 0;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = sync_grants_once(&api, &destination, reconciler.as_ref(), last_index) => r,
        };

        match result {
            Ok(GrantSyncOutcome::Applied(index)) => {
                record_sync("grants", "changed");
                last_index = index;
                backoff.reset();
            }
            Ok(GrantSyncOutcome::NotModified) => {
                record_sync("grants", "not_modified");
                backoff.reset();
            }
            Err(ConnectorError::Api(AppError::Unauthorized(e))) => {
                error!(error = %e, "Access key rejected, stopping grant sync");
                return Err(ConnectorError::Api(AppError::Unauthorized(e)));
            }
            Err(e) => {
                record_sync("grants", "error");
                error!(error = %e, "Grant sync failed");
            }
        }

        // a short pause even after success lets bursts of changes batch up
        let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before next grant sync");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Registers the destination and re-pushes its metadata when it changes.
pub struct DestinationSync {
    api: AccessClient,
    source: Arc<dyn DestinationSource>,
    id: Option<Id>,
    pushed: Option<CreateDestinationRequest>,
}

impl DestinationSync {
    pub fn new(api: AccessClient, source: Arc<dyn DestinationSource>) -> Self {
        Self {
            api,
            source,
            id: None,
            pushed: None,
        }
    }

    pub fn destination_id(&self) -> Option<Id> {
        self.id
    }

    /// Push the current description if it differs from the last one pushed.
    /// Returns whether anything was sent.
    #[instrument(skip(self))]
    pub async fn sync(&mut self) -> Result<bool, ConnectorError> {
        let desired = self.source.describe().await?;

        if let Some(id) = self.id {
            if self.pushed.as_ref() == Some(&desired) {
                return Ok(false);
            }
            match self.api.update_destination(id, &desired).await {
                Ok(_) => {
                    info!(destination_id = %id, "Updated destination");
                    self.pushed = Some(desired);
                    return Ok(true);
                }
                Err(e) if e.is_not_found() => {
                    warn!(destination_id = %id, "Destination was deleted on the server, registering again");
                    self.id = None;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let existing = self
            .api
            .list_destinations(&ListDestinationsQuery {
                unique_id: Some(desired.unique_id.clone()),
                ..Default::default()
            })
            .await?;

        let destination = match existing.items.first() {
            Some(found) => self.api.update_destination(found.id, &desired).await?,
            None => self.api.create_destination(&desired).await?,
        };
        info!(
            destination_id = %destination.id,
            name = %destination.name,
            kind = %destination.kind,
            "Registered destination"
        );

        self.id = Some(destination.id);
        self.pushed = Some(desired);
        Ok(true)
    }

    /// Sync on every tick until cancelled. Failures are logged and retried on
    /// the next tick.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) -> Result<(), ConnectorError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires at once; registration already happened
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            match self.sync().await {
                Ok(true) => record_sync("destination", "changed"),
                Ok(false) => {
                    record_sync("destination", "not_modified");
                    debug!("Destination unchanged");
                }
                Err(e) => {
                    record_sync("destination", "error");
                    error!(error = %e, "Destination sync failed");
                }
            }
        }
    }
}

/// One poll for open credential requests, answering each. Returns the index
/// to poll from next.
#[instrument(skip(api, issuer))]
pub async fn answer_pending_credentials(
    api: &AccessClient,
    destination: &str,
    issuer: &dyn CredentialIssuer,
    last_index: i64,
) -> Result<i64, ConnectorError> {
    let pending = api
        .list_destination_credentials(&ListDestinationCredentialsQuery {
            destination: destination.to_string(),
            last_update_index: last_index,
        })
        .await?;

    let now = Utc::now();
    for request in &pending.items {
        if request.answered || request.request_expires_at < now {
            continue;
        }
        match answer_one(api, issuer, request).await {
            Ok(()) => record_credential("answered"),
            Err(e) => {
                record_credential("error");
                warn!(credential_id = %request.id, error = %e, "Could not answer credential request");
            }
        }
    }

    Ok(pending.last_update_index.index)
}

async fn answer_one(
    api: &AccessClient,
    issuer: &dyn CredentialIssuer,
    request: &DestinationCredential,
) -> Result<(), ConnectorError> {
    let user = api.get_user(request.user_id).await?;
    let (bearer_token, credential_expires_at) = issuer.issue(&user).await?;

    api.answer_destination_credential(&AnswerDestinationCredentialRequest {
        id: request.id,
        organization_id: request.organization_id,
        bearer_token,
        credential_expires_at,
    })
    .await?;

    info!(credential_id = %request.id, user = %user.name, "Answered credential request");
    Ok(())
}

/// Answer credential requests until cancelled.
pub async fn run_credential_answers(
    api: AccessClient,
    destination: String,
    issuer: Arc<dyn CredentialIssuer>,
    cancel: CancellationToken,
) -> Result<(), ConnectorError> {
    let mut last_index = 0;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = answer_pending_credentials(&api, &destination, issuer.as_ref(), last_index) => r,
        };

        match result {
            Ok(index) => last_index = index,
            Err(e) if e.is_not_modified() => debug!("No credential requests"),
            Err(e) => {
                error!(error = %e, "Listing credential requests failed");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(CREDENTIAL_RETRY_DELAY) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder {
        snapshots: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl GrantReconciler for Recorder {
        async fn reconcile(&self, _api: &AccessClient, grants: &[Grant]) -> Result<(), ConnectorError> {
            let resources = grants.iter().map(|g| g.resource.clone()).collect();
            self.snapshots.lock().unwrap().push(resources);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl GrantReconciler for Failing {
        async fn reconcile(&self, _api: &AccessClient, _grants: &[Grant]) -> Result<(), ConnectorError> {
            Err(ConnectorError::Reconcile(vec!["boom".to_string()]))
        }
    }

    fn grant_json(id: &str, resource: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "created": "2024-01-01T00:00:00Z",
            "createdBy": "2",
            "updated": "2024-01-01T00:00:00Z",
            "subject": "u:3",
            "privilege": "view",
            "resource": resource,
        })
    }

    #[test]
    fn backoff_grows_to_a_minute_and_resets() {
        let mut backoff = grant_backoff();
        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(1600) && first <= Duration::from_millis(2400));

        for _ in 0..30 {
            let delay = backoff.next_backoff().unwrap();
            assert!(delay <= Duration::from_secs(72));
        }
        backoff.reset();
        assert!(backoff.next_backoff().unwrap() <= Duration::from_millis(2400));
    }

    #[tokio::test]
    async fn applied_snapshot_advances_the_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/grants"))
            .and(query_param("destination", "prod"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 2,
                "items": [grant_json("4", "prod"), grant_json("5", "prod.default")],
                "lastUpdateIndex": {"index": 17},
            })))
            .mount(&server)
            .await;

        let api = AccessClient::new(&server.uri(), "key").unwrap();
        let recorder = Recorder::default();
        let outcome = sync_grants_once(&api, "prod", &recorder, 0).await.unwrap();

        assert_eq!(outcome, GrantSyncOutcome::Applied(17));
        assert_eq!(
            recorder.snapshots.lock().unwrap().as_slice(),
            &[vec!["prod".to_string(), "prod.default".to_string()]]
        );
    }

    #[tokio::test]
    async fn not_modified_is_a_successful_sync() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/grants"))
            .and(query_param("lastUpdateIndex", "17"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let api = AccessClient::new(&server.uri(), "key").unwrap();
        let recorder = Recorder::default();
        let outcome = sync_grants_once(&api, "prod", &recorder, 17).await.unwrap();

        assert_eq!(outcome, GrantSyncOutcome::NotModified);
        assert!(recorder.snapshots.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_reconcile_does_not_advance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/grants"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 0, "items": [], "lastUpdateIndex": {"index": 9},
            })))
            .mount(&server)
            .await;

        let api = AccessClient::new(&server.uri(), "key").unwrap();
        let err = sync_grants_once(&api, "prod", &Failing, 3).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Reconcile(_)));
    }

    #[tokio::test]
    async fn revoked_key_stops_the_loop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/grants"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "unauthorized"})),
            )
            .mount(&server)
            .await;

        let api = AccessClient::new(&server.uri(), "key").unwrap();
        let result = run_grant_sync(
            api,
            "prod".to_string(),
            Arc::new(Recorder::default()),
            grant_backoff(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ConnectorError::Api(AppError::Unauthorized(_)))));
    }

    #[tokio::test]
    async fn cancellation_ends_the_loop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/grants"))
            .respond_with(ResponseTemplate::new(304).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let api = AccessClient::new(&server.uri(), "key").unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_grant_sync(
            api,
            "prod".to_string(),
            Arc::new(Recorder::default()),
            grant_backoff(),
            cancel.clone(),
        ));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    struct FixedSource(Mutex<CreateDestinationRequest>);

    #[async_trait]
    impl DestinationSource for FixedSource {
        async fn describe(&self) -> Result<CreateDestinationRequest, ConnectorError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn destination_json(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "uniqueID": "abc",
            "name": "prod",
            "kind": "kubernetes",
            "created": "2024-01-01T00:00:00Z",
            "updated": "2024-01-01T00:00:00Z",
            "connection": {"url": "10.0.0.1:443", "ca": ""},
            "resources": [],
            "roles": [],
            "lastSeen": null,
            "connected": true,
            "version": "",
        })
    }

    #[tokio::test]
    async fn destination_is_created_once_then_updated_only_on_change() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/destinations"))
            .and(query_param("uniqueID", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 0, "items": [], "lastUpdateIndex": {"index": 0},
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/destinations"))
            .respond_with(ResponseTemplate::new(201).set_body_json(destination_json("7")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/destinations/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(destination_json("7")))
            .expect(1)
            .mount(&server)
            .await;

        let source = Arc::new(FixedSource(Mutex::new(CreateDestinationRequest {
            unique_id: "abc".into(),
            name: "prod".into(),
            connection: service_core::api::DestinationConnection {
                url: "10.0.0.1:443".into(),
                ca: String::new(),
            },
            ..Default::default()
        })));
        let api = AccessClient::new(&server.uri(), "key").unwrap();
        let mut sync = DestinationSync::new(api, source.clone());

        assert!(sync.sync().await.unwrap());
        assert_eq!(sync.destination_id(), Some("7".parse::<Id>().unwrap()));
        assert!(!sync.sync().await.unwrap());

        source.0.lock().unwrap().resources = vec!["default".into()];
        assert!(sync.sync().await.unwrap());
    }

    struct StaticIssuer;

    #[async_trait]
    impl CredentialIssuer for StaticIssuer {
        async fn issue(&self, _user: &User) -> Result<(String, DateTime<Utc>), ConnectorError> {
            Ok(("foo.bar".to_string(), Utc::now() + chrono::Duration::minutes(5)))
        }
    }

    #[tokio::test]
    async fn open_requests_are_answered_and_expired_ones_skipped() {
        let server = MockServer::start().await;
        let open = serde_json::json!({
            "id": "a", "organizationID": "b", "userID": "c", "destinationID": "d",
            "requestExpiresAt": (Utc::now() + chrono::Duration::minutes(2)).to_rfc3339(),
            "updateIndex": 12, "answered": false,
        });
        let expired = serde_json::json!({
            "id": "e", "organizationID": "b", "userID": "c", "destinationID": "d",
            "requestExpiresAt": (Utc::now() - chrono::Duration::minutes(1)).to_rfc3339(),
            "updateIndex": 11, "answered": false,
        });
        Mock::given(method("GET"))
            .and(path("/api/credentials"))
            .and(query_param("destination", "prod"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 2, "items": [open, expired], "lastUpdateIndex": {"index": 12},
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/users/c"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "c", "name": "alice@example.com",
                "created": "2024-01-01T00:00:00Z", "updated": "2024-01-01T00:00:00Z",
                "lastSeenAt": null, "verified": true, "providerNames": [],
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/credentials"))
            .and(wiremock::matchers::body_partial_json(serde_json::json!({
                "id": "a", "bearerToken": "foo.bar",
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = AccessClient::new(&server.uri(), "key").unwrap();
        let next = answer_pending_credentials(&api, "prod", &StaticIssuer, 0).await.unwrap();
        assert_eq!(next, 12);
    }
}
