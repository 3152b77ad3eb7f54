//! Errors raised by the connector.

use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Api(#[from] AppError),

    #[error("kubernetes: {0}")]
    Kube(#[from] kube::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("certificate: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("{0}")]
    Authentication(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("invalid ssh host key {path}: {reason}")]
    HostKey { path: String, reason: String },

    /// Failures from independent steps of one reconcile pass.
    #[error("{}", .0.join("; "))]
    Reconcile(Vec<String>),

    #[error("{0}")]
    Internal(String),
}

impl ConnectorError {
    pub fn authentication(msg: impl Into<String>) -> Self {
        ConnectorError::Authentication(msg.into())
    }

    /// True for answers the server gives when nothing changed.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, ConnectorError::Api(AppError::NotModified))
    }
}

impl From<ConnectorError> for AppError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::Api(e) => e,
            ConnectorError::Authentication(msg) => AppError::Unauthorized(anyhow::anyhow!(msg)),
            ConnectorError::Config(msg) => AppError::ConfigError(anyhow::anyhow!(msg)),
            ConnectorError::Kube(e) => AppError::BadGateway(e.to_string()),
            other => AppError::InternalError(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_errors_are_joined() {
        let err = ConnectorError::Reconcile(vec![
            "remove user alice: busy".to_string(),
            "create user bob: exists".to_string(),
        ]);
        assert_eq!(err.to_string(), "remove user alice: busy; create user bob: exists");
    }

    #[test]
    fn not_modified_is_recognised() {
        assert!(ConnectorError::Api(AppError::NotModified).is_not_modified());
        assert!(!ConnectorError::authentication("nope").is_not_modified());
    }

    #[test]
    fn authentication_maps_to_unauthorized() {
        let app: AppError = ConnectorError::authentication("no bearer token found").into();
        assert!(matches!(app, AppError::Unauthorized(_)));
    }
}
