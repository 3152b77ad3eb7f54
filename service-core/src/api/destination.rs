use crate::uid::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use validator::Validate;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    #[default]
    Kubernetes,
    Ssh,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Kubernetes => "kubernetes",
            DestinationKind::Ssh => "ssh",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DestinationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kubernetes" => Ok(DestinationKind::Kubernetes),
            "ssh" => Ok(DestinationKind::Ssh),
            other => Err(format!("unknown destination kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DestinationConnection {
    #[validate(length(min = 1))]
    pub url: String,
    /// PEM bundle clients should trust when connecting to `url`.
    #[serde(default)]
    pub ca: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub id: Id,
    #[serde(rename = "uniqueID")]
    pub unique_id: String,
    pub name: String,
    pub kind: DestinationKind,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub connection: DestinationConnection,
    pub resources: Vec<String>,
    pub roles: Vec<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub connected: bool,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateDestinationRequest {
    #[serde(rename = "uniqueID")]
    #[validate(length(min = 1, max = 256))]
    pub unique_id: String,
    #[validate(length(min = 1, max = 256))]
    pub name: String,
    #[serde(default)]
    pub kind: DestinationKind,
    #[serde(default)]
    pub version: String,
    #[validate(nested)]
    pub connection: DestinationConnection,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

pub type UpdateDestinationRequest = CreateDestinationRequest;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDestinationsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<DestinationKind>,
    #[serde(default, rename = "uniqueID", skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
}

/// A just-in-time credential request for one user on one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationCredential {
    pub id: Id,
    #[serde(rename = "organizationID")]
    pub organization_id: Id,
    #[serde(rename = "userID")]
    pub user_id: Id,
    #[serde(rename = "destinationID")]
    pub destination_id: Id,
    pub request_expires_at: DateTime<Utc>,
    pub update_index: i64,
    pub answered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateDestinationCredentialRequest {
    #[validate(length(min = 1))]
    pub destination: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDestinationCredentialsQuery {
    pub destination: String,
    #[serde(default)]
    pub last_update_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AnswerDestinationCredentialRequest {
    pub id: Id,
    #[serde(rename = "organizationID")]
    pub organization_id: Id,
    #[validate(length(min = 1))]
    pub bearer_token: String,
    pub credential_expires_at: DateTime<Utc>,
}
