use crate::subject::Subject;
use crate::uid::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub id: Id,
    pub created: DateTime<Utc>,
    pub created_by: Id,
    pub updated: DateTime<Utc>,
    pub subject: Subject,
    pub privilege: String,
    pub resource: String,
}

impl Grant {
    /// Resource split at the first `.` into destination and sub-resource.
    pub fn destination_and_subresource(&self) -> (&str, Option<&str>) {
        match self.resource.split_once('.') {
            Some((dest, rest)) => (dest, Some(rest)),
            None => (self.resource.as_str(), None),
        }
    }
}

/// One grant in a create or bulk-update request. The subject may be given
/// directly or by user or group name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GrantRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[validate(length(min = 1, max = 256))]
    pub privilege: String,
    #[validate(length(min = 1, max = 512))]
    pub resource: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGrantResponse {
    #[serde(flatten)]
    pub grant: Grant,
    pub was_created: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGrantsRequest {
    #[serde(default)]
    pub grants_to_add: Vec<GrantRequest>,
    #[serde(default)]
    pub grants_to_remove: Vec<GrantRequest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListGrantsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privilege: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default)]
    pub show_inherited: bool,
    #[serde(default)]
    pub show_system: bool,
    #[serde(default)]
    pub last_update_index: i64,
}

impl ListGrantsQuery {
    pub fn is_blocking(&self) -> bool {
        self.last_update_index != 0
    }

    pub fn for_destination(destination: impl Into<String>, last_update_index: i64) -> Self {
        Self {
            destination: Some(destination.into()),
            last_update_index,
            ..Self::default()
        }
    }
}
