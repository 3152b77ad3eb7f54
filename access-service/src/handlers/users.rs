use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use service_core::api::{CreateUserRequest, CreateUserResponse, ListResponse, ListUsersQuery, UpdateUserRequest, User};
use service_core::error::AppError;
use service_core::uid::Id;
use validator::Validate;

use super::context::Deadline;
use crate::access::{credentials, identities, is_identity_self};
use crate::db::TxOptions;
use crate::middleware::Auth;
use crate::startup::AppState;
use crate::utils::Password;

/// GET /api/users
pub async fn list_users(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<ListResponse<User>>, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_only(), Deadline::Request).await?;
    let users = identities::list_identities(&mut rctx, &query).await?;
    rctx.commit().await?;
    Ok(Json(ListResponse::new(users, 0)))
}

/// POST /api/users
pub async fn create_user(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<CreateUserResponse>), AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let (identity, password) = identities::create_identity(&mut rctx, &req).await?;
    rctx.commit().await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            id: identity.id,
            name: identity.name,
            one_time_password: Some(password.expose().to_string()),
        }),
    ))
}

/// GET /api/users/:id
pub async fn get_user(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
) -> Result<Json<User>, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_only(), Deadline::Request).await?;
    let user = identities::get_identity(&mut rctx, id).await?;
    rctx.commit().await?;
    Ok(Json(user))
}

/// DELETE /api/users/:id
pub async fn delete_user(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
) -> Result<StatusCode, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    identities::delete_identity(&mut rctx, id).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/users/:id/password
///
/// Users change their own password with the old one; administrators reset
/// anyone else's to a one-time password.
pub async fn update_password(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Path(id): Path<Id>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<StatusCode, AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let password = Password::new(req.password);
    if is_identity_self(&rctx, id) {
        let old = req.old_password.map(Password::new);
        credentials::update_credential(&mut rctx, old.as_ref(), &password).await?;
    } else {
        credentials::reset_credential(&mut rctx, id, Some(&password)).await?;
    }
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
