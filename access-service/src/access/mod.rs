//! Access layer: authorization and business rules over the data layer.
//!
//! Every function takes a [`RequestContext`] carrying the request's
//! transaction and, for authenticated routes, the caller. Self-service
//! checks always run before role checks.

pub mod access_keys;
pub mod blocking;
pub mod credentials;
pub mod destination_credentials;
pub mod destinations;
pub mod device_flow;
pub mod grants;
pub mod groups;
pub mod identities;
pub mod login;
pub mod organizations;
pub mod providers;
pub mod tokens;

use crate::config::SessionConfig;
use crate::data;
use crate::db::{Database, Transaction, TxOptions};
use crate::error::AuthorizationError;
use crate::models::{AccessKey, Identity, Organization, INFRA_RESOURCE};
use crate::services::OidcClientFactory;
use service_core::error::AppError;
use service_core::subject::Subject;
use service_core::uid::Id;
use std::sync::Arc;
use tokio::time::Instant;

/// The caller of an authenticated request.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub access_key: AccessKey,
    pub user: Identity,
    pub organization: Organization,
}

/// Everything an access-layer call needs about the request in flight.
pub struct RequestContext {
    pub db: Database,
    /// Bound to the request's organization.
    pub tx: Transaction,
    pub authenticated: Option<Authenticated>,
    /// Blocking calls give up here.
    pub deadline: Instant,
    pub oidc: Arc<dyn OidcClientFactory>,
    /// Lifetime and inactivity window of keys minted by logins.
    pub session: SessionConfig,
}

impl RequestContext {
    pub fn authenticated(&self) -> Result<&Authenticated, AppError> {
        self.authenticated
            .as_ref()
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("authentication is required")))
    }

    pub fn user(&self) -> Result<&Identity, AppError> {
        Ok(&self.authenticated()?.user)
    }

    pub fn org_id(&self) -> Result<Id, AppError> {
        self.tx.org_id()
    }

    /// Commit the work so far and carry on in a fresh transaction bound to
    /// the same organization.
    pub async fn checkpoint(&mut self) -> Result<(), AppError> {
        let org_id = self.org_id()?;
        let fresh = self.db.begin_for_org(org_id, TxOptions::read_write()).await?;
        let done = std::mem::replace(&mut self.tx, fresh);
        done.commit().await
    }

    pub async fn commit(self) -> Result<(), AppError> {
        self.tx.commit().await
    }
}

/// True when the caller, directly or through a group, holds any of `roles`
/// on the API.
pub async fn has_role(rctx: &mut RequestContext, roles: &[&str]) -> Result<bool, AppError> {
    let user_id = rctx.user()?.id;
    let mut subjects = vec![Subject::User(user_id)];
    for group_id in data::groups::group_ids_for_identity(&mut rctx.tx, user_id).await? {
        subjects.push(Subject::Group(group_id));
    }
    for role in roles {
        if data::grants::has_grant(&mut rctx.tx, &subjects, role, INFRA_RESOURCE).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Fail with an [`AuthorizationError`] unless the caller holds one of `roles`.
pub async fn authorize(
    rctx: &mut RequestContext,
    operation: &str,
    resource: &str,
    roles: &[&str],
) -> Result<(), AppError> {
    if has_role(rctx, roles).await? {
        return Ok(());
    }
    Err(AuthorizationError::new(operation, resource, roles).into())
}

/// True when `id` is the caller. Never true for unauthenticated requests.
pub fn is_identity_self(rctx: &RequestContext, id: Id) -> bool {
    rctx.authenticated
        .as_ref()
        .is_some_and(|a| a.user.id == id)
}

/// Allow the caller's own records, otherwise require one of `roles`.
pub async fn authorize_self_or(
    rctx: &mut RequestContext,
    id: Id,
    operation: &str,
    resource: &str,
    roles: &[&str],
) -> Result<(), AppError> {
    if is_identity_self(rctx, id) {
        return Ok(());
    }
    authorize(rctx, operation, resource, roles).await
}
