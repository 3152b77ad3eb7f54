//! Application startup and lifecycle management.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::security_headers::security_headers_middleware;
use service_core::middleware::tracing::{make_request_span, request_id_middleware};
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::access::organizations::ensure_default_organization;
use crate::config::AccessConfig;
use crate::crypto::{FileSecretStorage, NativeKeyProvider};
use crate::data::encryption_keys::load_or_create_data_key;
use crate::db::Database;
use crate::handlers;
use crate::jobs::MaintenanceWorker;
use crate::middleware::auth_middleware;
use crate::models::Organization;
use crate::services::{get_metrics, init_metrics, OidcClientFactory, ReqwestOidcFactory};

/// Headroom past the blocking deadline so long-polls answer before the
/// outer timeout cuts them off.
const TIMEOUT_HEADROOM: Duration = Duration::from_secs(30);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: AccessConfig,
    pub db: Database,
    pub oidc: Arc<dyn OidcClientFactory>,
    /// Serves unauthenticated requests whose host matches no organization.
    pub default_org: Organization,
}

/// Liveness: the process is up and the database answers.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": state.config.service_name,
                    "version": state.config.service_version,
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.config.service_name,
                    "error": e.to_string(),
                })),
            )
        }
    }
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Every route of the HTTP API.
pub fn build_router(state: AppState) -> Router {
    use handlers::{access_keys, auth, credentials, destinations, grants, groups, organizations, providers, tokens, users};

    let public = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/.well-known/jwks.json", get(tokens::jwks))
        .route("/api/login", post(auth::login))
        .route("/api/password-reset", post(auth::confirm_password_reset))
        .route("/api/device", post(auth::start_device_flow))
        .route("/api/device/status", post(auth::poll_device_flow))
        .route("/api/providers", get(providers::list_providers))
        .route("/api/providers/:id", get(providers::get_provider));

    let authenticated = Router::new()
        .route("/api/logout", post(auth::logout))
        .route("/api/password-reset-request", post(auth::request_password_reset))
        .route("/api/device/approve", post(auth::approve_device_flow))
        .route("/api/users", get(users::list_users).post(users::create_user))
        .route("/api/users/:id", get(users::get_user).delete(users::delete_user))
        .route("/api/users/:id/password", put(users::update_password))
        .route("/api/groups", get(groups::list_groups).post(groups::create_group))
        .route("/api/groups/:id", get(groups::get_group).delete(groups::delete_group))
        .route("/api/groups/:id/users", axum::routing::patch(groups::update_users_in_group))
        .route(
            "/api/grants",
            get(grants::list_grants)
                .post(grants::create_grant)
                .patch(grants::update_grants),
        )
        .route("/api/grants/:id", delete(grants::delete_grant))
        .route(
            "/api/access-keys",
            get(access_keys::list_access_keys)
                .post(access_keys::create_access_key)
                .delete(access_keys::delete_access_keys_by_name),
        )
        .route("/api/access-keys/:id", delete(access_keys::delete_access_key))
        .route(
            "/api/destinations",
            get(destinations::list_destinations).post(destinations::create_destination),
        )
        .route(
            "/api/destinations/:id",
            get(destinations::get_destination)
                .put(destinations::update_destination)
                .delete(destinations::delete_destination),
        )
        .route("/api/tokens", post(tokens::create_token))
        .route("/api/providers", post(providers::create_provider))
        .route(
            "/api/providers/:id",
            put(providers::update_provider).delete(providers::delete_provider),
        )
        .route("/api/organizations", post(organizations::create_organization))
        .route(
            "/api/credentials",
            post(credentials::create_destination_credential)
                .get(credentials::list_destination_credentials)
                .put(credentials::answer_destination_credential),
        )
        .route_layer(from_fn_with_state(state.clone(), auth_middleware));

    let timeout = state.config.timeouts.blocking_request + TIMEOUT_HEADROOM;

    Router::new()
        .merge(public)
        .merge(authenticated)
        .with_state(state)
        .layer(TimeoutLayer::new(timeout))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    worker: MaintenanceWorker,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: AccessConfig) -> Result<Self, AppError> {
        let oidc = Arc::new(ReqwestOidcFactory::new()?);
        Self::build_internal(config, oidc).await
    }

    /// Build with a custom OIDC client factory, for tests that fake an
    /// identity provider.
    pub async fn build_with_oidc(
        config: AccessConfig,
        oidc: Arc<dyn OidcClientFactory>,
    ) -> Result<Self, AppError> {
        Self::build_internal(config, oidc).await
    }

    async fn build_internal(
        config: AccessConfig,
        oidc: Arc<dyn OidcClientFactory>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::connect(&config.database).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let provider = NativeKeyProvider::new(FileSecretStorage::new(config.keys.root_key_path.clone()));
        let data_key = load_or_create_data_key(
            db.pool(),
            &provider,
            &config.keys.data_key_name,
            &config.keys.root_key_id,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to load database data key");
            e
        })?;
        let db = db.with_data_key(data_key);

        let default_org = ensure_default_organization(&db, &config.default_org).await?;
        tracing::info!(
            org_id = %default_org.id,
            org_name = %default_org.name,
            "Default organization ready"
        );

        let worker = MaintenanceWorker::new(db.clone(), config.jobs.interval);

        let addr = config.common.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port, "Access service listener bound");

        Ok(Self {
            port,
            listener,
            state: AppState {
                config,
                db,
                oidc,
                default_org,
            },
            worker,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    pub fn default_org(&self) -> &Organization {
        &self.state.default_org
    }

    /// Run the HTTP server and the maintenance worker until the server stops.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state.clone());
        let shutdown = self.worker.shutdown_token();
        let worker = self.worker.start();

        tracing::info!(
            service = %self.state.config.service_name,
            version = %self.state.config.service_version,
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, router).await;

        shutdown.cancel();
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "Maintenance worker ended abnormally");
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
