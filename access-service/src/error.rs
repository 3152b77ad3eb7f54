//! Domain errors for the access layer.

use service_core::error::AppError;
use thiserror::Error;

/// A caller lacking every role that would allow an operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("you do not have permission to {operation} {resource}, requires role {}", .roles.join(", "))]
pub struct AuthorizationError {
    pub operation: String,
    pub resource: String,
    pub roles: Vec<String>,
}

impl AuthorizationError {
    pub fn new(operation: &str, resource: &str, roles: &[&str]) -> Self {
        Self {
            operation: operation.to_string(),
            resource: resource.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    NotAuthorized(#[from] AuthorizationError),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Expired(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotAuthorized(e) => AppError::Forbidden(anyhow::Error::new(e)),
            ServiceError::InvalidCredentials => {
                AppError::Unauthorized(anyhow::anyhow!("invalid credentials"))
            }
            ServiceError::BadRequest(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ServiceError::Forbidden(msg) => AppError::Forbidden(anyhow::anyhow!(msg)),
            ServiceError::Expired(msg) => AppError::Expired(msg),
            ServiceError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            ServiceError::Unauthorized(msg) => AppError::Unauthorized(anyhow::anyhow!(msg)),
        }
    }
}

impl From<AuthorizationError> for AppError {
    fn from(err: AuthorizationError) -> Self {
        ServiceError::from(err).into()
    }
}

pub fn bad_request(msg: impl Into<String>) -> AppError {
    ServiceError::BadRequest(msg.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn authorization_error_names_roles() {
        let err = AuthorizationError::new("create", "grant", &["admin", "support-admin"]);
        assert_eq!(
            err.to_string(),
            "you do not have permission to create grant, requires role admin, support-admin"
        );
        assert_eq!(AppError::from(err).status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn invalid_credentials_is_opaque() {
        let err: AppError = ServiceError::InvalidCredentials.into();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.to_string(), "Unauthorized: invalid credentials");
    }

    #[test]
    fn expired_maps_to_bad_request() {
        let err: AppError = ServiceError::Expired("token expired".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
