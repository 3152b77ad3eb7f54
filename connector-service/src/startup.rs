//! Connector startup and lifecycle management.

use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use service_core::api::{AccessClient, DestinationKind};
use service_core::error::AppError;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::authn::JwkAuthenticator;
use crate::certs::CertCache;
use crate::config::ConnectorConfig;
use crate::error::ConnectorError;
use crate::kubernetes::{KubeClient, KubernetesConnector};
use crate::metrics::{get_metrics, init_metrics};
use crate::proxy::{self, ProxyState};
use crate::ssh::{SshConnector, SystemLocalUsers};
use crate::sync::{
    grant_backoff, run_credential_answers, run_grant_sync, CredentialIssuer, DestinationSource, DestinationSync,
    GrantReconciler,
};

/// How long registration keeps retrying before the connector gives up.
const REGISTRATION_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// The TLS proxy in front of the Kubernetes API.
pub struct ProxyParts {
    pub listener: TcpListener,
    pub router: Router,
    pub certs: Arc<CertCache>,
}

/// The destination-specific pieces the loops drive.
pub struct Parts {
    pub reconciler: Arc<dyn GrantReconciler>,
    pub source: Arc<dyn DestinationSource>,
    pub issuer: Option<Arc<dyn CredentialIssuer>>,
    pub proxy: Option<ProxyParts>,
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

pub fn build_status_router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
}

/// Application container for the connector's loops and listeners.
pub struct Application {
    config: ConnectorConfig,
    api: AccessClient,
    status_listener: TcpListener,
    status_port: u16,
    parts: Parts,
}

impl Application {
    /// Build the connector for the configured destination kind.
    pub async fn build(config: ConnectorConfig) -> Result<Self, ConnectorError> {
        let parts = match config.kind {
            DestinationKind::Kubernetes => {
                let certs = Arc::new(CertCache::load_or_create(&config.tls.cert_cache_dir).await?);
                let kube = Arc::new(KubeClient::new(&config.kubernetes).await.map_err(|e| {
                    error!(error = %e, "Failed to create Kubernetes client");
                    e
                })?);
                let connector = Arc::new(KubernetesConnector::new(&config, kube, certs.clone()));

                let authn = Arc::new(JwkAuthenticator::new(&config.server.url)?);
                let state = ProxyState::new(&config.kubernetes, authn).await?;
                let listener = proxy::bind(config.kubernetes.proxy_addr).await?;

                Parts {
                    reconciler: connector.clone(),
                    source: connector.clone(),
                    issuer: Some(connector),
                    proxy: Some(ProxyParts {
                        listener,
                        router: proxy::router(state),
                        certs,
                    }),
                }
            }
            DestinationKind::Ssh => {
                let users = Arc::new(SystemLocalUsers::new(config.ssh.passwd_path.clone()));
                let connector = Arc::new(SshConnector::new(&config, users));
                Parts {
                    reconciler: connector.clone(),
                    source: connector,
                    issuer: None,
                    proxy: None,
                }
            }
        };

        Self::build_with_parts(config, parts).await
    }

    /// Build around caller-supplied destination pieces, for tests.
    pub async fn build_with_parts(config: ConnectorConfig, parts: Parts) -> Result<Self, ConnectorError> {
        init_metrics();

        let api = AccessClient::new(&config.server.url, &config.server.access_key)?
            .for_destination(&config.name, &config.service_version)?;

        let status_listener = TcpListener::bind(config.metrics_addr).await.map_err(|e| {
            error!(error = %e, addr = %config.metrics_addr, "Failed to bind status listener");
            e
        })?;
        let status_port = status_listener.local_addr()?.port();
        info!(port = status_port, "Status listener bound");

        Ok(Self {
            config,
            api,
            status_listener,
            status_port,
            parts,
        })
    }

    pub fn status_port(&self) -> u16 {
        self.status_port
    }

    /// Run every loop until `cancel` fires or one of them fails. The first
    /// failure stops the rest.
    pub async fn run_until_stopped(self, cancel: CancellationToken) -> Result<(), ConnectorError> {
        let Self {
            config,
            api,
            status_listener,
            parts,
            ..
        } = self;

        let mut destination = DestinationSync::new(api.clone(), parts.source);
        let registered = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = register(&mut destination) => r,
        };
        registered.map_err(|e| {
            error!(error = %e, "Failed to register destination");
            e
        })?;

        let mut tasks: JoinSet<Result<(), ConnectorError>> = JoinSet::new();

        tasks.spawn(run_grant_sync(
            api.clone(),
            config.name.clone(),
            parts.reconciler,
            grant_backoff(),
            cancel.clone(),
        ));
        tasks.spawn(destination.run(config.destination_sync_interval, cancel.clone()));

        if let Some(issuer) = parts.issuer {
            tasks.spawn(run_credential_answers(api.clone(), config.name.clone(), issuer, cancel.clone()));
        }
        if let Some(proxy) = parts.proxy {
            tasks.spawn(proxy::serve_tls(proxy.listener, proxy.router, proxy.certs, cancel.clone()));
        }

        let shutdown = cancel.clone();
        tasks.spawn(async move {
            axum::serve(status_listener, build_status_router())
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await?;
            Ok::<(), ConnectorError>(())
        });

        info!(
            destination = %config.name,
            kind = %config.kind,
            version = %config.service_version,
            "Connector running"
        );

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(ConnectorError::Internal(format!("task panicked: {}", e))));
            if let Err(e) = result {
                error!(error = %e, "Connector task failed, stopping");
                first_error.get_or_insert(e);
                cancel.cancel();
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Register the destination, retrying transient failures. A rejected access
/// key fails at once.
async fn register(sync: &mut DestinationSync) -> Result<(), ConnectorError> {
    let mut policy = ExponentialBackoff {
        max_elapsed_time: Some(REGISTRATION_DEADLINE),
        ..grant_backoff()
    };
    loop {
        match sync.sync().await {
            Ok(_) => return Ok(()),
            Err(e @ ConnectorError::Api(AppError::Unauthorized(_))) | Err(e @ ConnectorError::Config(_)) => {
                return Err(e)
            }
            Err(e) => {
                let Some(delay) = policy.next_backoff() else {
                    return Err(e);
                };
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "Destination registration failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
