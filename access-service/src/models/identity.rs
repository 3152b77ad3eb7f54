use chrono::{DateTime, Utc};
use service_core::api;
use service_core::subject::Subject;
use service_core::uid::Id;
use sqlx::FromRow;

use super::CONNECTOR_IDENTITY_NAME;

/// A user or service principal.
#[derive(Debug, Clone, FromRow)]
pub struct Identity {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_by: Id,
    pub verified: bool,
}

impl Identity {
    pub fn new(organization_id: Id, name: impl Into<String>, created_by: Id) -> Self {
        let now = Utc::now();
        Self {
            id: Id::generate(),
            organization_id,
            created_at: now,
            updated_at: now,
            name: name.into(),
            last_seen_at: None,
            created_by,
            verified: false,
        }
    }

    pub fn poly_id(&self) -> Subject {
        Subject::User(self.id)
    }

    pub fn is_connector(&self) -> bool {
        self.name == CONNECTOR_IDENTITY_NAME
    }

    pub fn to_api(&self, provider_names: Vec<String>) -> api::User {
        api::User {
            id: self.id,
            name: self.name.clone(),
            created: self.created_at,
            updated: self.updated_at,
            last_seen_at: self.last_seen_at,
            verified: self.verified,
            provider_names,
        }
    }
}
