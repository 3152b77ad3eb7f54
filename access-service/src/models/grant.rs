use chrono::{DateTime, Utc};
use service_core::api;
use service_core::subject::Subject;
use service_core::uid::Id;
use sqlx::FromRow;

/// `(subject, privilege, resource)`. Grants are created and deleted, never edited.
#[derive(Debug, Clone, FromRow)]
pub struct Grant {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub subject: Subject,
    pub privilege: String,
    pub resource: String,
    pub created_by: Id,
    pub update_index: i64,
}

impl Grant {
    pub fn new(
        subject: Subject,
        privilege: impl Into<String>,
        resource: impl Into<String>,
        created_by: Id,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Id::generate(),
            organization_id: Id::default(),
            created_at: now,
            updated_at: now,
            subject,
            privilege: privilege.into(),
            resource: resource.into(),
            created_by,
            update_index: 0,
        }
    }

    pub fn to_api(&self) -> api::Grant {
        api::Grant {
            id: self.id,
            created: self.created_at,
            created_by: self.created_by,
            updated: self.updated_at,
            subject: self.subject,
            privilege: self.privilege.clone(),
            resource: self.resource.clone(),
        }
    }
}
