use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use service_core::api::{
    AccessKey, CreateAccessKeyRequest, CreateAccessKeyResponse, DeleteAccessKeysQuery, ListAccessKeysQuery,
    ListResponse,
};
use service_core::error::AppError;
use service_core::uid::Id;
use validator::Validate;

use super::context::Deadline;
use crate::access::access_keys;
use crate::db::TxOptions;
use crate::middleware::Auth;
use crate::startup::AppState;

/// GET /api/access-keys
pub async fn list_access_keys(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Query(query): Query<ListAccessKeysQuery>,
) -> Result<Json<ListResponse<AccessKey>>, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_only(), Deadline::Request).await?;
    let keys = access_keys::list_access_keys(&mut rctx, &query).await?;
    rctx.commit().await?;
    Ok(Json(ListResponse::new(keys.iter().map(|k| k.to_api()).collect(), 0)))
}

/// POST /api/access-keys
pub async fn create_access_key(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<CreateAccessKeyRequest>,
) -> Result<(StatusCode, Json<CreateAccessKeyResponse>), AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let key = access_keys::create_access_key(&mut rctx, &req).await?;
    rctx.commit().await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateAccessKeyResponse {
            id: key.id,
            created: key.created_at,
            name: key.name.clone(),
            issued_for: key.issued_for,
            provider_id: key.provider_id,
            expires: key.expires_at,
            extension_deadline: key.extension_deadline,
            access_key: key.token(),
        }),
    ))
}

/// DELETE /api/access-keys?name=
pub async fn delete_access_keys_by_name(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Query(query): Query<DeleteAccessKeysQuery>,
) -> Result<StatusCode, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    access_keys::delete_access_key_by_name(&mut rctx, &query.name).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/access-keys/:id
pub async fn delete_access_key(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
) -> Result<StatusCode, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    access_keys::delete_access_key(&mut rctx, id).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
