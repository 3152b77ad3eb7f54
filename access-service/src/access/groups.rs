use super::{authorize, is_identity_self, RequestContext};
use crate::data;
use crate::data::grants::DeleteGrants;
use crate::data::groups::ListGroupsOptions;
use crate::models::{Group, ADMIN_ROLE, CONNECTOR_ROLE, VIEW_ROLE};
use service_core::api::{ListGroupsQuery, UpdateUsersInGroupRequest};
use service_core::error::AppError;
use service_core::subject::Subject;
use service_core::uid::Id;
use tracing::{info, instrument};

const READ_ROLES: [&str; 3] = [ADMIN_ROLE, VIEW_ROLE, CONNECTOR_ROLE];

#[instrument(skip(rctx))]
pub async fn create_group(rctx: &mut RequestContext, name: &str) -> Result<Group, AppError> {
    authorize(rctx, "create", "group", &[ADMIN_ROLE]).await?;

    let mut group = Group::new(rctx.org_id()?, name.trim(), rctx.user()?.id);
    data::groups::create_group(&mut rctx.tx, &mut group).await?;
    info!(group_id = %group.id, "Created group");
    Ok(group)
}

/// Members of a group may read it without a role.
#[instrument(skip(rctx))]
pub async fn get_group(rctx: &mut RequestContext, id: Id) -> Result<Group, AppError> {
    let user_id = rctx.user()?.id;
    let member_of = data::groups::group_ids_for_identity(&mut rctx.tx, user_id).await?;
    if !member_of.contains(&id) {
        authorize(rctx, "get", "group", &READ_ROLES).await?;
    }
    data::groups::get_group(&mut rctx.tx, id).await
}

#[instrument(skip(rctx))]
pub async fn list_groups(rctx: &mut RequestContext, query: &ListGroupsQuery) -> Result<Vec<Group>, AppError> {
    let own = query.user_id.is_some_and(|id| is_identity_self(rctx, id));
    if !own {
        authorize(rctx, "list", "groups", &READ_ROLES).await?;
    }

    let opts = ListGroupsOptions {
        by_name: query.name.clone(),
        by_member: query.user_id,
        by_ids: Vec::new(),
    };
    data::groups::list_groups(&mut rctx.tx, &opts).await
}

/// Delete a group together with the grants it holds.
#[instrument(skip(rctx))]
pub async fn delete_group(rctx: &mut RequestContext, id: Id) -> Result<(), AppError> {
    authorize(rctx, "delete", "group", &[ADMIN_ROLE]).await?;

    match data::groups::get_group(&mut rctx.tx, id).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    }
    let removed = data::grants::delete_grants(&mut rctx.tx, DeleteGrants::BySubject(Subject::Group(id))).await?;
    data::groups::delete_group(&mut rctx.tx, id).await?;
    info!(group_id = %id, grants_removed = removed, "Deleted group");
    Ok(())
}

#[instrument(skip(rctx, req), fields(add = req.users_to_add.len(), remove = req.users_to_remove.len()))]
pub async fn update_users_in_group(
    rctx: &mut RequestContext,
    group_id: Id,
    req: &UpdateUsersInGroupRequest,
) -> Result<(), AppError> {
    authorize(rctx, "update", "group", &[ADMIN_ROLE]).await?;

    let group = data::groups::get_group(&mut rctx.tx, group_id).await?;
    for &id in &req.users_to_add {
        data::identities::get_identity(&mut rctx.tx, id).await?;
    }
    data::groups::add_users_to_group(&mut rctx.tx, group.id, &req.users_to_add).await?;
    data::groups::remove_users_from_group(&mut rctx.tx, group.id, &req.users_to_remove).await?;
    Ok(())
}
