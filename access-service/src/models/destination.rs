use chrono::{DateTime, Duration, Utc};
use service_core::api::{self, DestinationConnection, DestinationKind};
use service_core::uid::Id;
use sqlx::FromRow;

/// A destination counts as connected when it checked in this recently.
pub const CONNECTED_WITHIN_MINUTES: i64 = 6;

#[derive(Debug, Clone, FromRow)]
pub struct Destination {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub unique_id: String,
    pub kind: String,
    pub connection_url: String,
    pub connection_ca: String,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub version: String,
    pub resources: Vec<String>,
    pub roles: Vec<String>,
}

impl Destination {
    pub fn from_request(organization_id: Id, req: &api::CreateDestinationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Id::generate(),
            organization_id,
            created_at: now,
            updated_at: now,
            name: req.name.clone(),
            unique_id: req.unique_id.clone(),
            kind: req.kind.as_str().to_string(),
            connection_url: req.connection.url.clone(),
            connection_ca: req.connection.ca.clone(),
            last_seen_at: None,
            version: req.version.clone(),
            resources: req.resources.clone(),
            roles: req.roles.clone(),
        }
    }

    pub fn is_connected(&self, now: DateTime<Utc>) -> bool {
        self.last_seen_at
            .map(|seen| now - seen < Duration::minutes(CONNECTED_WITHIN_MINUTES))
            .unwrap_or(false)
    }

    pub fn to_api(&self) -> api::Destination {
        api::Destination {
            id: self.id,
            unique_id: self.unique_id.clone(),
            name: self.name.clone(),
            kind: self.kind.parse().unwrap_or(DestinationKind::Kubernetes),
            created: self.created_at,
            updated: self.updated_at,
            connection: DestinationConnection {
                url: self.connection_url.clone(),
                ca: self.connection_ca.clone(),
            },
            resources: self.resources.clone(),
            roles: self.roles.clone(),
            last_seen: self.last_seen_at,
            connected: self.is_connected(Utc::now()),
            version: self.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination(last_seen_at: Option<DateTime<Utc>>) -> Destination {
        let req = api::CreateDestinationRequest {
            unique_id: "abc".into(),
            name: "prod".into(),
            kind: DestinationKind::Ssh,
            version: "0.1.0".into(),
            connection: DestinationConnection::default(),
            resources: vec![],
            roles: vec![],
        };
        Destination {
            last_seen_at,
            ..Destination::from_request(Id::from_i64(1), &req)
        }
    }

    #[test]
    fn connected_means_seen_within_six_minutes() {
        let now = Utc::now();
        assert!(destination(Some(now - Duration::minutes(5))).is_connected(now));
        assert!(!destination(Some(now - Duration::minutes(7))).is_connected(now));
        assert!(!destination(None).is_connected(now));
    }

    #[test]
    fn kind_survives_conversion() {
        assert_eq!(destination(None).to_api().kind, DestinationKind::Ssh);
    }
}
