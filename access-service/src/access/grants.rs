use super::blocking::{run_blocking_request, BlockingQuery, QueryResult};
use super::{authorize, has_role, is_identity_self, RequestContext};
use crate::data;
use crate::data::grants::{DeleteGrants, ListGrantsOptions};
use crate::db::{Channel, Transaction};
use crate::error::{bad_request, AuthorizationError};
use crate::models::{Grant, ADMIN_ROLE, CONNECTOR_ROLE, INFRA_RESOURCE, SUPPORT_ADMIN_ROLE, VIEW_ROLE};
use service_core::api::{self, GrantRequest, ListGrantsQuery, ListResponse, UpdateGrantsRequest};
use service_core::axum::async_trait;
use service_core::error::AppError;
use service_core::subject::Subject;
use service_core::uid::Id;
use tracing::{info, instrument};

const LIST_ROLES: [&str; 3] = [ADMIN_ROLE, VIEW_ROLE, CONNECTOR_ROLE];

async fn user_in_group(rctx: &mut RequestContext, group_id: Id) -> Result<bool, AppError> {
    let user_id = rctx.user()?.id;
    let groups = data::groups::group_ids_for_identity(&mut rctx.tx, user_id).await?;
    Ok(groups.contains(&group_id))
}

/// Turn a request's subject, given by ID or by name, into a [`Subject`].
async fn resolve_subject(tx: &mut Transaction, req: &GrantRequest) -> Result<Subject, AppError> {
    if let Some(subject) = req.subject {
        return Ok(subject);
    }
    if let Some(name) = req.user_name.as_deref().filter(|n| !n.is_empty()) {
        let user = data::identities::get_identity_by_name(tx, name).await?;
        return Ok(Subject::User(user.id));
    }
    if let Some(name) = req.group_name.as_deref().filter(|n| !n.is_empty()) {
        let group = data::groups::get_group_by_name(tx, name).await?;
        return Ok(Subject::Group(group.id));
    }
    Err(bad_request("subject, userName or groupName is required"))
}

async fn grant_from_request(rctx: &mut RequestContext, req: &GrantRequest) -> Result<Grant, AppError> {
    let created_by = rctx.user()?.id;
    let subject = resolve_subject(&mut rctx.tx, req).await?;
    Ok(Grant::new(subject, req.privilege.clone(), req.resource.clone(), created_by))
}

fn is_last_admin_check(grant: &Grant) -> bool {
    grant.privilege == ADMIN_ROLE && grant.resource == INFRA_RESOURCE
}

async fn ensure_an_admin_remains(rctx: &mut RequestContext) -> Result<(), AppError> {
    if data::grants::count_grants(&mut rctx.tx, ADMIN_ROLE, INFRA_RESOURCE).await? == 0 {
        return Err(bad_request("cannot remove the last infra admin"));
    }
    Ok(())
}

/// Create a grant. An identical existing grant is returned with `false`.
#[instrument(skip(rctx, req), fields(privilege = %req.privilege, resource = %req.resource))]
pub async fn create_grant(rctx: &mut RequestContext, req: &GrantRequest) -> Result<(Grant, bool), AppError> {
    if req.privilege == SUPPORT_ADMIN_ROLE && req.resource == INFRA_RESOURCE {
        authorize(rctx, "create", "grant", &[SUPPORT_ADMIN_ROLE]).await?;
    } else {
        authorize(rctx, "create", "grant", &[ADMIN_ROLE]).await?;
    }

    let mut grant = grant_from_request(rctx, req).await?;
    if data::grants::create_grant(&mut rctx.tx, &mut grant).await? {
        info!(grant_id = %grant.id, subject = %grant.subject, "Created grant");
        return Ok((grant, true));
    }

    let existing = data::grants::find_grant(&mut rctx.tx, grant.subject, &grant.privilege, &grant.resource)
        .await?
        .ok_or_else(|| AppError::Conflict(anyhow::anyhow!("grant already exists")))?;
    Ok((existing, false))
}

/// Soft-delete a grant. Deleting a missing grant succeeds.
#[instrument(skip(rctx))]
pub async fn delete_grant(rctx: &mut RequestContext, id: Id) -> Result<(), AppError> {
    authorize(rctx, "delete", "grant", &[ADMIN_ROLE]).await?;

    let grant = match data::grants::get_grant(&mut rctx.tx, id).await {
        Ok(grant) => grant,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    data::grants::delete_grants(&mut rctx.tx, DeleteGrants::ById(id)).await?;
    if is_last_admin_check(&grant) {
        ensure_an_admin_remains(rctx).await?;
    }
    Ok(())
}

#[instrument(skip(rctx, req), fields(add = req.grants_to_add.len(), remove = req.grants_to_remove.len()))]
pub async fn update_grants(rctx: &mut RequestContext, req: &UpdateGrantsRequest) -> Result<(), AppError> {
    authorize(rctx, "update", "grants", &[ADMIN_ROLE]).await?;

    let mut add = Vec::with_capacity(req.grants_to_add.len());
    for r in &req.grants_to_add {
        add.push(grant_from_request(rctx, r).await?);
    }
    let mut remove = Vec::with_capacity(req.grants_to_remove.len());
    for r in &req.grants_to_remove {
        remove.push(grant_from_request(rctx, r).await?);
    }

    data::grants::update_grants(&mut rctx.tx, &mut add, &remove).await?;
    if remove.iter().any(is_last_admin_check) {
        ensure_an_admin_remains(rctx).await?;
    }
    Ok(())
}

fn list_options(query: &ListGrantsQuery) -> ListGrantsOptions {
    ListGrantsOptions {
        by_subject: query.subject,
        include_inherited_from_groups: query.show_inherited,
        by_privileges: query.privilege.iter().cloned().collect(),
        by_resource: query.resource.clone(),
        by_destination: query.destination.clone(),
        exclude_connector_grant: !query.show_system,
    }
}

struct GrantsByDestination {
    opts: ListGrantsOptions,
    destination: String,
}

#[async_trait]
impl BlockingQuery for GrantsByDestination {
    type Output = Vec<Grant>;

    async fn run(&mut self, tx: &mut Transaction) -> Result<QueryResult<Vec<Grant>>, AppError> {
        let grants = data::grants::list_grants(tx, &self.opts).await?;
        let update_index = data::grants::grants_max_update_index(tx, &self.destination).await?;
        Ok(QueryResult {
            count: grants.len(),
            items: grants,
            update_index,
        })
    }

    // an emptied destination is news too
    fn is_done(&self, result: &QueryResult<Vec<Grant>>, last_index: i64) -> bool {
        result.update_index > last_index
    }
}

/// List grants. With a destination and a last update index this blocks
/// until the destination's grants change past that index.
#[instrument(skip(rctx, query), fields(destination = ?query.destination, last_update_index = query.last_update_index))]
pub async fn list_grants(
    rctx: &mut RequestContext,
    query: &ListGrantsQuery,
) -> Result<ListResponse<api::Grant>, AppError> {
    if !has_role(rctx, &LIST_ROLES).await? {
        let allowed = match query.subject {
            Some(Subject::User(id)) => is_identity_self(rctx, id),
            Some(Subject::Group(id)) => user_in_group(rctx, id).await?,
            _ => false,
        };
        if !allowed {
            return Err(AuthorizationError::new("list", "grants", &LIST_ROLES).into());
        }
    }

    let opts = list_options(query);

    if !query.is_blocking() {
        let grants = data::grants::list_grants(&mut rctx.tx, &opts).await?;
        let index = match query.destination.as_deref() {
            Some(dest) => data::grants::grants_max_update_index(&mut rctx.tx, dest).await?,
            None => grants.iter().map(|g| g.update_index).max().unwrap_or(1),
        };
        return Ok(ListResponse::new(grants.iter().map(Grant::to_api).collect(), index));
    }

    let destination_name = query
        .destination
        .clone()
        .ok_or_else(|| bad_request("destination is required for a blocking request"))?;
    let destination = data::destinations::get_destination_by_name(&mut rctx.tx, &destination_name).await?;
    let org_id = rctx.org_id()?;

    let mut channels = vec![Channel::GrantsByDestination {
        org_id,
        destination_id: destination.id,
    }];
    if let (Some(Subject::User(user_id)), true) = (query.subject, query.show_inherited) {
        for group_id in data::groups::group_ids_for_identity(&mut rctx.tx, user_id).await? {
            channels.push(Channel::GroupMembers { org_id, group_id });
        }
    }

    let result = run_blocking_request(
        &rctx.db,
        org_id,
        &channels,
        query.last_update_index,
        rctx.deadline,
        "list_grants",
        GrantsByDestination {
            opts,
            destination: destination_name,
        },
    )
    .await?;

    Ok(ListResponse::new(
        result.items.iter().map(Grant::to_api).collect(),
        result.update_index,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_options_hide_connector_grant_by_default() {
        let query = ListGrantsQuery::for_destination("prod", 0);
        let opts = list_options(&query);
        assert!(opts.exclude_connector_grant);
        assert_eq!(opts.by_destination.as_deref(), Some("prod"));
        assert!(opts.by_privileges.is_empty());

        let query = ListGrantsQuery {
            privilege: Some("view".into()),
            show_system: true,
            ..ListGrantsQuery::default()
        };
        let opts = list_options(&query);
        assert!(!opts.exclude_connector_grant);
        assert_eq!(opts.by_privileges, vec!["view".to_string()]);
    }

    #[test]
    fn only_infra_admin_grants_are_guarded() {
        let user = Subject::User(Id::from_i64(1));
        assert!(is_last_admin_check(&Grant::new(user, ADMIN_ROLE, INFRA_RESOURCE, Id::default())));
        assert!(!is_last_admin_check(&Grant::new(user, ADMIN_ROLE, "prod", Id::default())));
        assert!(!is_last_admin_check(&Grant::new(user, VIEW_ROLE, INFRA_RESOURCE, Id::default())));
    }
}
