use chrono::{DateTime, Utc};
use service_core::api;
use service_core::uid::Id;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Infra,
    Oidc,
    Okta,
    Azure,
    Google,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Infra => "infra",
            ProviderKind::Oidc => "oidc",
            ProviderKind::Okta => "okta",
            ProviderKind::Azure => "azure",
            ProviderKind::Google => "google",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "infra" => Ok(ProviderKind::Infra),
            "" | "oidc" => Ok(ProviderKind::Oidc),
            "okta" => Ok(ProviderKind::Okta),
            "azure" => Ok(ProviderKind::Azure),
            "google" => Ok(ProviderKind::Google),
            other => Err(format!("unknown provider kind: {}", other)),
        }
    }
}

/// An identity source. `client_secret` is plain here and sealed in the table.
#[derive(Debug, Clone, FromRow)]
pub struct Provider {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub kind: String,
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub scopes: Vec<String>,
    pub private_key: String,
    pub client_email: String,
    pub domain_admin_email: String,
    pub created_by: Id,
}

impl Provider {
    pub fn kind(&self) -> ProviderKind {
        self.kind.parse().unwrap_or(ProviderKind::Oidc)
    }

    pub fn to_api(&self) -> api::Provider {
        api::Provider {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind.clone(),
            created: self.created_at,
            updated: self.updated_at,
            url: self.url.clone(),
            client_id: self.client_id.clone(),
        }
    }
}

/// What an external IdP last told us about one identity. Tokens are plain here.
#[derive(Debug, Clone, FromRow)]
pub struct ProviderUser {
    pub identity_id: Id,
    pub provider_id: Id,
    pub organization_id: Id,
    pub email: String,
    pub groups: Vec<String>,
    pub last_update: DateTime<Utc>,
    pub redirect_url: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}
