use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use service_core::api::{CreateProviderRequest, ListResponse, Provider, UpdateProviderRequest};
use service_core::error::AppError;
use service_core::uid::Id;
use validator::Validate;

use super::context::{Deadline, HostOrg};
use crate::access::providers;
use crate::db::TxOptions;
use crate::middleware::Auth;
use crate::startup::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListProvidersQuery {
    #[serde(default)]
    pub name: Option<String>,
}

/// GET /api/providers
///
/// Public so login pages can offer the configured providers.
pub async fn list_providers(
    State(state): State<AppState>,
    HostOrg(org): HostOrg,
    Query(query): Query<ListProvidersQuery>,
) -> Result<Json<ListResponse<Provider>>, AppError> {
    let mut rctx = state.public_context(&org, TxOptions::read_only()).await?;
    let found = providers::list_providers(&mut rctx, query.name).await?;
    rctx.commit().await?;
    Ok(Json(ListResponse::new(found.iter().map(|p| p.to_api()).collect(), 0)))
}

/// GET /api/providers/:id
pub async fn get_provider(
    State(state): State<AppState>,
    HostOrg(org): HostOrg,
    Path(id): Path<Id>,
) -> Result<Json<Provider>, AppError> {
    let mut rctx = state.public_context(&org, TxOptions::read_only()).await?;
    let provider = providers::get_provider(&mut rctx, id).await?;
    rctx.commit().await?;
    Ok(Json(provider.to_api()))
}

/// POST /api/providers
pub async fn create_provider(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<CreateProviderRequest>,
) -> Result<(StatusCode, Json<Provider>), AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let provider = providers::create_provider(&mut rctx, &req).await?;
    rctx.commit().await?;
    Ok((StatusCode::CREATED, Json(provider.to_api())))
}

/// PUT /api/providers/:id
pub async fn update_provider(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
    Json(req): Json<UpdateProviderRequest>,
) -> Result<Json<Provider>, AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let provider = providers::update_provider(&mut rctx, id, &req).await?;
    rctx.commit().await?;
    Ok(Json(provider.to_api()))
}

/// DELETE /api/providers/:id
pub async fn delete_provider(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
) -> Result<StatusCode, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    providers::delete_provider(&mut rctx, id).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
