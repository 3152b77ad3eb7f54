use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use service_core::api::{CreateGroupRequest, Group, ListGroupsQuery, ListResponse, UpdateUsersInGroupRequest};
use service_core::error::AppError;
use service_core::uid::Id;
use validator::Validate;

use super::context::Deadline;
use crate::access::groups;
use crate::db::TxOptions;
use crate::middleware::Auth;
use crate::startup::AppState;

/// GET /api/groups
pub async fn list_groups(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Query(query): Query<ListGroupsQuery>,
) -> Result<Json<ListResponse<Group>>, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_only(), Deadline::Request).await?;
    let groups = groups::list_groups(&mut rctx, &query).await?;
    rctx.commit().await?;
    Ok(Json(ListResponse::new(groups.iter().map(|g| g.to_api()).collect(), 0)))
}

/// POST /api/groups
pub async fn create_group(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Group>), AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let group = groups::create_group(&mut rctx, &req.name).await?;
    rctx.commit().await?;
    Ok((StatusCode::CREATED, Json(group.to_api())))
}

/// GET /api/groups/:id
pub async fn get_group(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
) -> Result<Json<Group>, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_only(), Deadline::Request).await?;
    let group = groups::get_group(&mut rctx, id).await?;
    rctx.commit().await?;
    Ok(Json(group.to_api()))
}

/// DELETE /api/groups/:id
pub async fn delete_group(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
) -> Result<StatusCode, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    groups::delete_group(&mut rctx, id).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /api/groups/:id/users
pub async fn update_users_in_group(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
    Json(req): Json<UpdateUsersInGroupRequest>,
) -> Result<StatusCode, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    groups::update_users_in_group(&mut rctx, id, &req).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
