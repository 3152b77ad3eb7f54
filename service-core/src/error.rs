use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Forbidden: {0}")]
    Forbidden(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Not modified")]
    NotModified,

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Expired: {0}")]
    Expired(String),

    #[error("access key has expired")]
    AccessKeyExpired,

    #[error("access key has exceeded the extension deadline")]
    AccessKeyDeadlineExceeded,

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadRequest(_) | AppError::Expired(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_)
            | AppError::AccessKeyExpired
            | AppError::AccessKeyDeadlineExceeded
            | AppError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotModified => StatusCode::NOT_MODIFIED,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError(_) | AppError::DatabaseError(_) | AppError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound(anyhow::anyhow!("record not found")),
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "a record with that value already exists ({})",
                    db_err.constraint().unwrap_or("unique")
                ))
            }
            other => AppError::DatabaseError(anyhow::Error::new(other)),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return AppError::BadGateway(err.to_string());
        }
        match err.status() {
            Some(status) if status == reqwest::StatusCode::UNAUTHORIZED => {
                AppError::Unauthorized(anyhow::Error::new(err))
            }
            Some(status) if status == reqwest::StatusCode::FORBIDDEN => {
                AppError::Forbidden(anyhow::Error::new(err))
            }
            Some(status) if status == reqwest::StatusCode::NOT_FOUND => {
                AppError::NotFound(anyhow::Error::new(err))
            }
            _ => AppError::BadGateway(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let status = self.status();

        if status == StatusCode::NOT_MODIFIED {
            return status.into_response();
        }

        let (error_message, details) = match self {
            AppError::ValidationError(err) => {
                ("Validation error".to_string(), Some(err.to_string()))
            }
            AppError::BadRequest(err)
            | AppError::NotFound(err)
            | AppError::Unauthorized(err)
            | AppError::Forbidden(err)
            | AppError::Conflict(err) => (err.to_string(), None),
            AppError::Expired(msg) => (msg, None),
            AppError::Timeout(msg) => (format!("Request timed out: {}", msg), None),
            err @ (AppError::AccessKeyExpired | AppError::AccessKeyDeadlineExceeded) => {
                (err.to_string(), None)
            }
            AppError::InternalError(err) => {
                tracing::error!(error = ?err, "Internal server error");
                ("Internal server error".to_string(), None)
            }
            AppError::BadGateway(msg) => (format!("Bad Gateway: {}", msg), None),
            AppError::ServiceUnavailable => ("Service unavailable".to_string(), None),
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Database error");
                ("Database error".to_string(), None)
            }
            AppError::InvalidToken(err) => ("Invalid token".to_string(), Some(err.to_string())),
            AppError::ConfigError(err) => {
                ("Configuration error".to_string(), Some(err.to_string()))
            }
            AppError::NotModified => (String::new(), None),
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_kinds_to_status_codes() {
        assert_eq!(AppError::NotModified.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(
            AppError::Timeout("wait".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(AppError::AccessKeyExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::Expired("token".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::BadGateway("idp".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn row_not_found_is_not_found() {
        assert!(AppError::from(sqlx::Error::RowNotFound).is_not_found());
    }

    #[test]
    fn not_modified_has_no_body() {
        let response = AppError::NotModified.into_response();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }
}
