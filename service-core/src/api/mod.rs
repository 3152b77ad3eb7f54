//! Wire types shared by the server and the connector, and the HTTP client the
//! connector uses to talk to the server.

pub mod client;
pub mod destination;
pub mod grant;
pub mod identity;
pub mod token;

pub use client::AccessClient;
pub use destination::*;
pub use grant::*;
pub use identity::*;
pub use token::{verify_token, Jwk, JwkSet, TokenClaims};

use serde::{Deserialize, Serialize};

/// Response header mirroring [`LastUpdateIndex`] for clients that only read headers.
pub const LAST_UPDATE_INDEX_HEADER: &str = "Last-Update-Index";
/// Sent by connectors so the server can track destination liveness.
pub const DESTINATION_NAME_HEADER: &str = "Infra-Destination-Name";
pub const VERSION_HEADER: &str = "Infra-Version";

/// Privilege that lets a subject open sessions on a destination without
/// binding any destination role.
pub const CONNECT_PRIVILEGE: &str = "connect";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LastUpdateIndex {
    pub index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    pub count: usize,
    pub items: Vec<T>,
    #[serde(default)]
    pub last_update_index: LastUpdateIndex,
}

impl<T> ListResponse<T> {
    pub fn new(items: Vec<T>, last_update_index: i64) -> Self {
        Self {
            count: items.len(),
            items,
            last_update_index: LastUpdateIndex {
                index: last_update_index,
            },
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> ListResponse<U> {
        ListResponse {
            count: self.count,
            items: self.items.into_iter().map(f).collect(),
            last_update_index: self.last_update_index,
        }
    }
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
