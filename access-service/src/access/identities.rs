use super::credentials::{ensure_infra_provider_user, set_password};
use super::{authorize, authorize_self_or, is_identity_self, RequestContext};
use crate::data;
use crate::data::identities::ListIdentitiesOptions;
use crate::error::bad_request;
use crate::models::{Identity, ADMIN_ROLE, CONNECTOR_ROLE, VIEW_ROLE};
use crate::utils::{generate_one_time_password, Password};
use service_core::api::{CreateUserRequest, ListUsersQuery, User};
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::{info, instrument};

const READ_ROLES: [&str; 3] = [ADMIN_ROLE, VIEW_ROLE, CONNECTOR_ROLE];

/// Create a user known to the built-in provider, with a one-time password
/// they must change at first login.
#[instrument(skip(rctx, req), fields(name = %req.name))]
pub async fn create_identity(
    rctx: &mut RequestContext,
    req: &CreateUserRequest,
) -> Result<(Identity, Password), AppError> {
    authorize(rctx, "create", "user", &[ADMIN_ROLE]).await?;

    let created_by = rctx.user()?.id;
    let mut identity = Identity::new(rctx.org_id()?, req.name.trim(), created_by);
    data::identities::create_identity(&mut rctx.tx, &mut identity).await?;
    ensure_infra_provider_user(&mut rctx.tx, &identity).await?;

    let password = generate_one_time_password();
    set_password(&mut rctx.tx, identity.id, &password, true).await?;

    info!(identity_id = %identity.id, "Created user");
    Ok((identity, password))
}

async fn with_providers(rctx: &mut RequestContext, identity: &Identity) -> Result<User, AppError> {
    let names = data::providers::provider_names_for_identity(&mut rctx.tx, identity.id).await?;
    Ok(identity.to_api(names))
}

#[instrument(skip(rctx))]
pub async fn get_identity(rctx: &mut RequestContext, id: Id) -> Result<User, AppError> {
    authorize_self_or(rctx, id, "get", "user", &READ_ROLES).await?;
    let identity = data::identities::get_identity(&mut rctx.tx, id).await?;
    with_providers(rctx, &identity).await
}

#[instrument(skip(rctx))]
pub async fn list_identities(rctx: &mut RequestContext, query: &ListUsersQuery) -> Result<Vec<User>, AppError> {
    authorize(rctx, "list", "users", &READ_ROLES).await?;

    let opts = ListIdentitiesOptions {
        by_name: query.name.clone(),
        by_group: query.group,
        by_ids: Vec::new(),
        show_system: query.show_system,
    };
    let identities = data::identities::list_identities(&mut rctx.tx, &opts).await?;

    let mut users = Vec::with_capacity(identities.len());
    for identity in &identities {
        users.push(with_providers(rctx, identity).await?);
    }
    Ok(users)
}

/// Delete a user and everything issued to them. Deleting a missing user
/// succeeds.
#[instrument(skip(rctx))]
pub async fn delete_identity(rctx: &mut RequestContext, id: Id) -> Result<(), AppError> {
    authorize(rctx, "delete", "user", &[ADMIN_ROLE]).await?;
    if is_identity_self(rctx, id) {
        return Err(bad_request("cannot delete your own user"));
    }

    let identity = match data::identities::get_identity(&mut rctx.tx, id).await {
        Ok(identity) => identity,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    if identity.is_connector() {
        return Err(bad_request("cannot delete the connector user"));
    }

    data::identities::delete_identities(&mut rctx.tx, &[identity.id]).await?;
    info!(identity_id = %identity.id, "Deleted user");
    Ok(())
}
