use chrono::{DateTime, Utc};
use service_core::api;
use service_core::uid::Id;
use sqlx::FromRow;

/// May create access keys for identities other than the connector.
pub const SCOPE_ALLOW_CREATE_ACCESS_KEY: &str = "allow-create-access-key";
/// May approve a device-flow pairing.
pub const SCOPE_ALLOW_APPROVE_DEVICE_FLOW: &str = "allow-approve-device-flow-request";
/// Issued by a password reset; dropped once the password is changed.
pub const SCOPE_PASSWORD_RESET: &str = "password-reset";

pub const KEY_ID_LEN: usize = 10;
pub const SECRET_LEN: usize = 24;

/// A bearer credential. Only the SHA-256 of the secret is stored.
#[derive(Debug, Clone, Default, FromRow)]
pub struct AccessKey {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub issued_for: Id,
    pub provider_id: Id,
    pub key_id: String,
    pub secret_checksum: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub extension_seconds: i64,
    pub extension_deadline: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    #[sqlx(default)]
    pub issued_for_name: String,
    /// Set only on the value returned from creation.
    #[sqlx(skip)]
    pub secret: String,
}

impl AccessKey {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// The bearer form `<keyID>.<secret>`; empty unless just created.
    pub fn token(&self) -> String {
        if self.secret.is_empty() {
            return String::new();
        }
        format!("{}.{}", self.key_id, self.secret)
    }

    pub fn to_api(&self) -> api::AccessKey {
        api::AccessKey {
            id: self.id,
            name: self.name.clone(),
            created: self.created_at,
            issued_for: self.issued_for,
            issued_for_name: self.issued_for_name.clone(),
            provider_id: self.provider_id,
            expires: self.expires_at,
            extension_deadline: self.extension_deadline,
            scopes: self.scopes.clone(),
        }
    }
}

/// Split `<keyID>.<secret>`, checking both halves have the right length.
pub fn split_token(token: &str) -> Option<(&str, &str)> {
    let (key_id, secret) = token.split_once('.')?;
    if key_id.len() != KEY_ID_LEN || secret.len() != SECRET_LEN {
        return None;
    }
    Some((key_id, secret))
}
