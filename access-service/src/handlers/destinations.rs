use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use service_core::api::{
    CreateDestinationRequest, Destination, ListDestinationsQuery, ListResponse, UpdateDestinationRequest,
};
use service_core::error::AppError;
use service_core::uid::Id;
use validator::Validate;

use super::context::Deadline;
use crate::access::destinations;
use crate::db::TxOptions;
use crate::middleware::Auth;
use crate::startup::AppState;

/// GET /api/destinations
pub async fn list_destinations(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Query(query): Query<ListDestinationsQuery>,
) -> Result<Json<ListResponse<Destination>>, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_only(), Deadline::Request).await?;
    let found = destinations::list_destinations(&mut rctx, &query).await?;
    rctx.commit().await?;
    Ok(Json(ListResponse::new(found.iter().map(|d| d.to_api()).collect(), 0)))
}

/// POST /api/destinations
pub async fn create_destination(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<CreateDestinationRequest>,
) -> Result<(StatusCode, Json<Destination>), AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let destination = destinations::create_destination(&mut rctx, &req).await?;
    rctx.commit().await?;
    Ok((StatusCode::CREATED, Json(destination.to_api())))
}

/// GET /api/destinations/:id
pub async fn get_destination(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
) -> Result<Json<Destination>, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_only(), Deadline::Request).await?;
    let destination = destinations::get_destination(&mut rctx, id).await?;
    rctx.commit().await?;
    Ok(Json(destination.to_api()))
}

/// PUT /api/destinations/:id
pub async fn update_destination(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
    Json(req): Json<UpdateDestinationRequest>,
) -> Result<Json<Destination>, AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let destination = destinations::update_destination(&mut rctx, id, &req).await?;
    rctx.commit().await?;
    Ok(Json(destination.to_api()))
}

/// DELETE /api/destinations/:id
pub async fn delete_destination(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
) -> Result<StatusCode, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    destinations::delete_destination(&mut rctx, id).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
