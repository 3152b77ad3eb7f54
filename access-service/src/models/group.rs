use chrono::{DateTime, Utc};
use service_core::api;
use service_core::subject::Subject;
use service_core::uid::Id;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct Group {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub created_by: Id,
    /// Zero for groups created through the API.
    pub created_by_provider: Id,
    /// Filled by list queries that count members.
    #[sqlx(default)]
    pub total_users: i64,
}

impl Group {
    pub fn new(organization_id: Id, name: impl Into<String>, created_by: Id) -> Self {
        let now = Utc::now();
        Self {
            id: Id::generate(),
            organization_id,
            created_at: now,
            updated_at: now,
            name: name.into(),
            created_by,
            created_by_provider: Id::default(),
            total_users: 0,
        }
    }

    pub fn poly_id(&self) -> Subject {
        Subject::Group(self.id)
    }

    pub fn to_api(&self) -> api::Group {
        api::Group {
            id: self.id,
            name: self.name.clone(),
            created: self.created_at,
            updated: self.updated_at,
            total_users: self.total_users,
        }
    }
}
