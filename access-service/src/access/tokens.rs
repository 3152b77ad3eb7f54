use super::login::update_identity_info_from_provider;
use super::RequestContext;
use crate::data;
use crate::data::groups::ListGroupsOptions;
use crate::services::issue_token;
use chrono::{DateTime, Utc};
use service_core::api::JwkSet;
use service_core::error::AppError;
use tracing::instrument;

/// Sign a short-lived identity token for the caller, listing their groups.
/// Users from an external provider are re-checked with it first.
#[instrument(skip(rctx))]
pub async fn create_token(rctx: &mut RequestContext) -> Result<(String, DateTime<Utc>), AppError> {
    update_identity_info_from_provider(rctx).await?;

    let user = rctx.user()?.clone();
    let groups = data::groups::list_groups(
        &mut rctx.tx,
        &ListGroupsOptions {
            by_member: Some(user.id),
            ..ListGroupsOptions::default()
        },
    )
    .await?;
    let settings = data::settings::get_settings(&mut rctx.tx).await?;

    issue_token(
        &settings.signing_key()?,
        &user.name,
        groups.into_iter().map(|g| g.name).collect(),
        Utc::now(),
    )
}

/// The public half of the organization's signing key.
pub async fn jwks(rctx: &mut RequestContext) -> Result<JwkSet, AppError> {
    let settings = data::settings::get_settings(&mut rctx.tx).await?;
    Ok(JwkSet {
        keys: vec![settings.verification_key()?],
    })
}
