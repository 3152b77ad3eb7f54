//! Request plumbing shared by the handlers: the per-request transaction and
//! deadline, and the organization of unauthenticated requests.

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use service_core::error::AppError;
use tokio::time::Instant;

use crate::access::{organizations, Authenticated, RequestContext};
use crate::db::TxOptions;
use crate::models::Organization;
use crate::startup::AppState;

/// How long the access layer may take before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Request,
    /// Long-polls and the credential rendezvous.
    Blocking,
}

impl AppState {
    fn deadline(&self, deadline: Deadline) -> Instant {
        let timeout = match deadline {
            Deadline::Request => self.config.timeouts.request,
            Deadline::Blocking => self.config.timeouts.blocking_request,
        };
        Instant::now() + timeout
    }

    /// Context for an authenticated call, bound to the caller's organization.
    pub async fn context(
        &self,
        authenticated: Authenticated,
        opts: TxOptions,
        deadline: Deadline,
    ) -> Result<RequestContext, AppError> {
        let tx = self
            .db
            .begin_for_org(authenticated.organization.id, opts)
            .await?;
        Ok(RequestContext {
            db: self.db.clone(),
            tx,
            authenticated: Some(authenticated),
            deadline: self.deadline(deadline),
            oidc: self.oidc.clone(),
            session: self.config.session.clone(),
        })
    }

    /// Context for an unauthenticated call against `org`.
    pub async fn public_context(&self, org: &Organization, opts: TxOptions) -> Result<RequestContext, AppError> {
        let tx = self.db.begin_for_org(org.id, opts).await?;
        Ok(RequestContext {
            db: self.db.clone(),
            tx,
            authenticated: None,
            deadline: self.deadline(Deadline::Request),
            oidc: self.oidc.clone(),
            session: self.config.session.clone(),
        })
    }
}

/// The organization serving the request `Host`, or the default organization.
pub struct HostOrg(pub Organization);

#[axum::async_trait]
impl<S> FromRequestParts<S> for HostOrg
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();

        let org = organizations::organization_for_host(&state.db, host).await?;
        Ok(HostOrg(org.unwrap_or_else(|| state.default_org.clone())))
    }
}
