use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
};
use service_core::api::{
    CreateGrantResponse, Grant, GrantRequest, ListGrantsQuery, ListResponse, UpdateGrantsRequest,
    LAST_UPDATE_INDEX_HEADER,
};
use service_core::error::AppError;
use service_core::uid::Id;
use validator::Validate;

use super::context::Deadline;
use crate::access::grants;
use crate::db::TxOptions;
use crate::middleware::Auth;
use crate::startup::AppState;

/// GET /api/grants
///
/// Blocks when both `destination` and `lastUpdateIndex` are given.
pub async fn list_grants(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Query(query): Query<ListGrantsQuery>,
) -> Result<(HeaderMap, Json<ListResponse<Grant>>), AppError> {
    let deadline = if query.is_blocking() {
        Deadline::Blocking
    } else {
        Deadline::Request
    };
    let mut rctx = state.context(auth, TxOptions::read_only(), deadline).await?;
    let grants = grants::list_grants(&mut rctx, &query).await?;
    rctx.commit().await?;

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&grants.last_update_index.index.to_string()) {
        headers.insert(LAST_UPDATE_INDEX_HEADER, value);
    }
    Ok((headers, Json(grants)))
}

/// POST /api/grants
///
/// 201 for a new grant, 200 when an identical grant already exists.
pub async fn create_grant(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<GrantRequest>,
) -> Result<(StatusCode, Json<CreateGrantResponse>), AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let (grant, was_created) = grants::create_grant(&mut rctx, &req).await?;
    rctx.commit().await?;

    let status = if was_created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(CreateGrantResponse {
            grant: grant.to_api(),
            was_created,
        }),
    ))
}

/// PATCH /api/grants
pub async fn update_grants(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<UpdateGrantsRequest>,
) -> Result<StatusCode, AppError> {
    for grant in req.grants_to_add.iter().chain(&req.grants_to_remove) {
        grant.validate()?;
    }

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    grants::update_grants(&mut rctx, &req).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/grants/:id
pub async fn delete_grant(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
) -> Result<StatusCode, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    grants::delete_grant(&mut rctx, id).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
