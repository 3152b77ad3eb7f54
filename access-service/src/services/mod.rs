//! Services layer for access-service.
//!
//! Token signing, the OIDC client used for federated login, and the
//! Prometheus registry.

pub mod jwt;
pub mod metrics;
pub mod oidc;

pub use metrics::{get_metrics, init_metrics};

pub use jwt::{generate_signing_jwk, issue_token, TOKEN_LIFETIME_MINUTES};
pub use oidc::{
    HttpOidcClient, OidcClient, OidcClientFactory, ProviderTokens, ReqwestOidcFactory, UserInfo,
};
