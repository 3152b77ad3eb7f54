use chrono::{DateTime, Utc};
use service_core::api;
use service_core::uid::Id;
use sqlx::FromRow;

/// Rendezvous row between a user waiting for a credential and the connector
/// that mints it. `bearer_token` is sealed in the database and plain here.
#[derive(Debug, Clone, FromRow)]
pub struct DestinationCredential {
    pub id: Id,
    pub organization_id: Id,
    pub user_id: Id,
    pub destination_id: Id,
    pub request_expires_at: DateTime<Utc>,
    pub update_index: i64,
    pub answered: bool,
    pub credential_expires_at: Option<DateTime<Utc>>,
    pub bearer_token: Option<String>,
}

impl DestinationCredential {
    pub fn to_api(&self) -> api::DestinationCredential {
        api::DestinationCredential {
            id: self.id,
            organization_id: self.organization_id,
            user_id: self.user_id,
            destination_id: self.destination_id,
            request_expires_at: self.request_expires_at,
            update_index: self.update_index,
            answered: self.answered,
            credential_expires_at: self.credential_expires_at,
            bearer_token: self.bearer_token.clone(),
        }
    }
}
