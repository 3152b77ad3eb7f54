//! Database entities. Each maps one table row; API shapes live in
//! `service_core::api` and are produced with `to_api`.

pub mod access_key;
pub mod credential;
pub mod destination;
pub mod destination_credential;
pub mod device_flow;
pub mod grant;
pub mod group;
pub mod identity;
pub mod organization;
pub mod provider;
pub mod settings;

pub use access_key::{AccessKey, SCOPE_ALLOW_APPROVE_DEVICE_FLOW, SCOPE_ALLOW_CREATE_ACCESS_KEY, SCOPE_PASSWORD_RESET};
pub use credential::{Credential, PasswordResetToken};
pub use destination::Destination;
pub use destination_credential::DestinationCredential;
pub use device_flow::DeviceFlowAuthRequest;
pub use grant::Grant;
pub use group::Group;
pub use identity::Identity;
pub use organization::{EncryptionKey, Organization};
pub use provider::{Provider, ProviderKind, ProviderUser};
pub use settings::{PasswordRequirements, Settings};

/// Role granting full control of the API.
pub const ADMIN_ROLE: &str = "admin";
/// Read-only role over the API.
pub const VIEW_ROLE: &str = "view";
pub const SUPPORT_ADMIN_ROLE: &str = "support-admin";
/// Role held by the built-in connector identity.
pub const CONNECTOR_ROLE: &str = "connector";

/// Resource naming the control-plane API itself.
pub const INFRA_RESOURCE: &str = "infra";
/// Name of the identity every organization's connectors authenticate as.
pub const CONNECTOR_IDENTITY_NAME: &str = "connector";
/// Name of the built-in provider.
pub const INFRA_PROVIDER_NAME: &str = "infra";
