use chrono::{DateTime, Utc};
use service_core::uid::Id;
use sqlx::FromRow;

/// A local password for an identity.
#[derive(Debug, Clone, FromRow)]
pub struct Credential {
    pub id: Id,
    pub organization_id: Id,
    pub identity_id: Id,
    pub password_hash: String,
    /// Set when someone other than the owner chose the password.
    pub one_time_password: bool,
}

/// Single-use token mailed to a user who forgot their password.
#[derive(Debug, Clone, FromRow)]
pub struct PasswordResetToken {
    pub id: Id,
    pub organization_id: Id,
    pub token: String,
    pub identity_id: Id,
    pub expires_at: DateTime<Utc>,
}
