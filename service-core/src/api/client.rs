//! HTTP client for the access API, used by the connector.

use super::*;
use crate::error::AppError;
use crate::observability::inject_trace_context;
use crate::uid::Id;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::instrument;

/// Longer than the server's blocking-request timeout so long-polls end with a
/// 304 from the server rather than a client-side timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6 * 60);

#[derive(Clone)]
pub struct AccessClient {
    http: reqwest::Client,
    base_url: String,
    access_key: String,
    headers: HeaderMap,
}

impl std::fmt::Debug for AccessClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl AccessClient {
    pub fn new(base_url: &str, access_key: &str) -> Result<Self, AppError> {
        Self::with_timeout(base_url, access_key, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        access_key: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_key: access_key.to_string(),
            headers: HeaderMap::new(),
        })
    }

    /// Identify requests as coming from the connector for `destination`.
    pub fn for_destination(mut self, destination: &str, version: &str) -> Result<Self, AppError> {
        let name = HeaderValue::from_str(destination)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("destination name: {}", e)))?;
        let version = HeaderValue::from_str(version)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("version: {}", e)))?;
        self.headers.insert(DESTINATION_NAME_HEADER, name);
        self.headers.insert(VERSION_HEADER, version);
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut headers = self.headers.clone();
        inject_trace_context(&mut headers);

        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_key)
            .headers(headers)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, AppError> {
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Err(AppError::NotModified);
        }
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(error_for_status(status, message))
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<(), AppError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(error_for_status(status, message))
    }

    /// Grants for a destination. With a non-zero `last_update_index` the call
    /// blocks until something changes and fails with `NotModified` otherwise.
    #[instrument(skip(self), fields(destination = ?query.destination))]
    pub async fn list_grants(&self, query: &ListGrantsQuery) -> Result<ListResponse<Grant>, AppError> {
        self.send(self.request(Method::GET, "/api/grants").query(query))
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_user(&self, id: Id) -> Result<User, AppError> {
        self.send(self.request(Method::GET, &format!("/api/users/{}", id)))
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_group(&self, id: Id) -> Result<Group, AppError> {
        self.send(self.request(Method::GET, &format!("/api/groups/{}", id)))
            .await
    }

    #[instrument(skip(self))]
    pub async fn list_destinations(
        &self,
        query: &ListDestinationsQuery,
    ) -> Result<ListResponse<Destination>, AppError> {
        self.send(self.request(Method::GET, "/api/destinations").query(query))
            .await
    }

    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_destination(
        &self,
        req: &CreateDestinationRequest,
    ) -> Result<Destination, AppError> {
        self.send(self.request(Method::POST, "/api/destinations").json(req))
            .await
    }

    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn update_destination(
        &self,
        id: Id,
        req: &UpdateDestinationRequest,
    ) -> Result<Destination, AppError> {
        self.send(
            self.request(Method::PUT, &format!("/api/destinations/{}", id))
                .json(req),
        )
        .await
    }

    /// Open credential requests for a destination (connector side).
    #[instrument(skip(self), fields(destination = %query.destination))]
    pub async fn list_destination_credentials(
        &self,
        query: &ListDestinationCredentialsQuery,
    ) -> Result<ListResponse<DestinationCredential>, AppError> {
        self.send(self.request(Method::GET, "/api/credentials").query(query))
            .await
    }

    #[instrument(skip(self, req), fields(id = %req.id))]
    pub async fn answer_destination_credential(
        &self,
        req: &AnswerDestinationCredentialRequest,
    ) -> Result<(), AppError> {
        self.send_empty(self.request(Method::PUT, "/api/credentials").json(req))
            .await
    }

    /// Ask for a credential on a destination and wait for a connector to answer.
    #[instrument(skip(self))]
    pub async fn create_destination_credential(
        &self,
        destination: &str,
    ) -> Result<DestinationCredential, AppError> {
        let req = CreateDestinationCredentialRequest {
            destination: destination.to_string(),
        };
        self.send(self.request(Method::POST, "/api/credentials").json(&req))
            .await
    }

    #[instrument(skip(self))]
    pub async fn create_token(&self) -> Result<CreateTokenResponse, AppError> {
        self.send(self.request(Method::POST, "/api/tokens")).await
    }
}

fn error_for_status(status: StatusCode, message: String) -> AppError {
    match status {
        StatusCode::BAD_REQUEST => AppError::BadRequest(anyhow::anyhow!(message)),
        StatusCode::UNAUTHORIZED => AppError::Unauthorized(anyhow::anyhow!(message)),
        StatusCode::FORBIDDEN => AppError::Forbidden(anyhow::anyhow!(message)),
        StatusCode::NOT_FOUND => AppError::NotFound(anyhow::anyhow!(message)),
        StatusCode::CONFLICT => AppError::Conflict(anyhow::anyhow!(message)),
        StatusCode::GATEWAY_TIMEOUT => AppError::Timeout(message),
        StatusCode::BAD_GATEWAY => AppError::BadGateway(message),
        StatusCode::SERVICE_UNAVAILABLE => AppError::ServiceUnavailable,
        _ => AppError::InternalError(anyhow::anyhow!("{}: {}", status, message)),
    }
}
