//! Impersonating Kubernetes API proxy.
//!
//! Users reach the cluster through the connector with a short-lived JWT from
//! the server. The proxy checks it, swaps it for the connector's own
//! service-account token and asks the API server to impersonate the user and
//! their groups, so RBAC bindings on user and group names apply.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::authn::JwkAuthenticator;
use crate::certs::{CertCache, CertResolver};
use crate::config::KubernetesConfig;
use crate::error::ConnectorError;
use crate::metrics::observe_proxy_request;

const IMPERSONATE_USER: &str = "impersonate-user";
const IMPERSONATE_GROUP: &str = "impersonate-group";
const IN_CLUSTER_API: &str = "https://kubernetes.default.svc";
/// Request bodies are buffered; responses (watches, logs) stream.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
pub struct ProxyState {
    authn: Arc<JwkAuthenticator>,
    http: reqwest::Client,
    upstream: String,
    token_path: PathBuf,
}

impl ProxyState {
    pub async fn new(config: &KubernetesConfig, authn: Arc<JwkAuthenticator>) -> Result<Self, ConnectorError> {
        let ca = tokio::fs::read(&config.ca_path).await?;
        let cert = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| ConnectorError::Config(format!("cluster CA {}: {}", config.ca_path.display(), e)))?;
        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConnectorError::Config(format!("proxy http client: {}", e)))?;

        Ok(Self::with_client(http, upstream_url(config), config.token_path.clone(), authn))
    }

    pub fn with_client(
        http: reqwest::Client,
        upstream: impl Into<String>,
        token_path: impl Into<PathBuf>,
        authn: Arc<JwkAuthenticator>,
    ) -> Self {
        Self {
            authn,
            http,
            upstream: upstream.into().trim_end_matches('/').to_string(),
            token_path: token_path.into(),
        }
    }
}

/// API server address: the configured URL, or the in-cluster service.
pub fn upstream_url(config: &KubernetesConfig) -> String {
    if let Some(url) = &config.api_url {
        return url.clone();
    }
    match (
        std::env::var("KUBERNETES_SERVICE_HOST"),
        std::env::var("KUBERNETES_SERVICE_PORT"),
    ) {
        (Ok(host), Ok(port)) if host.contains(':') => format!("https://[{}]:{}", host, port),
        (Ok(host), Ok(port)) => format!("https://{}:{}", host, port),
        _ => IN_CLUSTER_API.to_string(),
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .fallback(proxy_request)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Headers for the upstream request: the caller's minus credentials and
/// connection-scoped ones, plus impersonation and the connector's token.
fn upstream_headers(
    incoming: &HeaderMap,
    user: &str,
    groups: &[String],
    bearer: &str,
) -> Result<HeaderMap, ConnectorError> {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower)
            || lower == "host"
            || lower == "authorization"
            || lower.starts_with("impersonate-")
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let value = |v: &str| {
        HeaderValue::from_str(v).map_err(|e| ConnectorError::authentication(format!("invalid claim for header: {}", e)))
    };
    headers.insert(HeaderName::from_static(IMPERSONATE_USER), value(user)?);
    for group in groups {
        headers.append(HeaderName::from_static(IMPERSONATE_GROUP), value(group)?);
    }
    headers.insert(
        axum::http::header::AUTHORIZATION,
        value(&format!("Bearer {}", bearer))?,
    );
    Ok(headers)
}

async fn proxy_request(State(state): State<ProxyState>, request: Request) -> Response {
    let start = Instant::now();
    let method = request.method().clone();

    let response = forward(&state, request).await.unwrap_or_else(|e| {
        let status = match &e {
            ConnectorError::Authentication(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_GATEWAY,
        };
        if status == StatusCode::UNAUTHORIZED {
            info!(error = %e, "Failed to authenticate request");
        } else {
            error!(error = %e, "Proxy request failed");
        }
        status.into_response()
    });

    observe_proxy_request(method.as_str(), response.status().as_u16(), start.elapsed().as_secs_f64());
    response
}

async fn forward(state: &ProxyState, request: Request) -> Result<Response, ConnectorError> {
    let claims = state.authn.authenticate(request.headers()).await?;

    let bearer = tokio::fs::read_to_string(&state.token_path).await?;
    let headers = upstream_headers(request.headers(), &claims.name, &claims.groups, bearer.trim())?;

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream, path);
    debug!(user = %claims.name, method = %request.method(), url = %url, "Proxying request");

    let method = request.method().clone();
    let body = axum::body::to_bytes(request.into_body(), MAX_REQUEST_BODY)
        .await
        .map_err(|e| ConnectorError::Internal(format!("read request body: {}", e)))?;
    let upstream = state
        .http
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| ConnectorError::Internal(format!("upstream request: {}", e)))?;

    let mut response = Response::builder().status(upstream.status());
    if let Some(out) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            if !HOP_BY_HOP.contains(&name.as_str()) {
                out.append(name.clone(), value.clone());
            }
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ConnectorError::Internal(format!("build response: {}", e)))
}

/// Serve `router` over TLS with certificates from `certs` until cancelled.
pub async fn serve_tls(
    listener: TcpListener,
    router: Router,
    certs: Arc<CertCache>,
    cancel: CancellationToken,
) -> Result<(), ConnectorError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(CertResolver(certs)));
    tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(tls));

    info!(addr = %listener.local_addr()?, "Proxy listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(router.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let builder = auto::Builder::new(TokioExecutor::new());
            let connection = builder.serve_connection(TokioIo::new(tls_stream), service);
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = connection => {
                    if let Err(e) = result {
                        debug!(peer = %peer, error = %e, "Connection closed with error");
                    }
                }
            }
        });
    }
}

/// Bind the proxy listener.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ConnectorError> {
    TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind proxy listener");
        e.into()
    })
}
