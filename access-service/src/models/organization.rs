use chrono::{DateTime, Utc};
use service_core::api;
use service_core::uid::Id;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct Organization {
    pub id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub domain: String,
    pub created_by: Id,
}

impl Organization {
    pub fn to_api(&self) -> api::Organization {
        api::Organization {
            id: self.id,
            name: self.name.clone(),
            domain: self.domain.clone(),
            created: self.created_at,
            updated: self.updated_at,
        }
    }
}

/// A data key as stored: only its root-key-encrypted form.
#[derive(Debug, Clone, FromRow)]
pub struct EncryptionKey {
    pub id: Id,
    pub name: String,
    pub encrypted: Vec<u8>,
    pub algorithm: String,
    pub root_key_id: String,
}
