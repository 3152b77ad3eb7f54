use axum::{
    extract::{Json, State},
    http::StatusCode,
};
use service_core::api::{CreateTokenResponse, JwkSet};
use service_core::error::AppError;

use super::context::{Deadline, HostOrg};
use crate::access::tokens;
use crate::db::TxOptions;
use crate::middleware::Auth;
use crate::startup::AppState;

/// POST /api/tokens
///
/// Read-write: an identity provider that rejects the user revokes their keys
/// here.
pub async fn create_token(
    State(state): State<AppState>,
    Auth(auth): Auth,
) -> Result<(StatusCode, Json<CreateTokenResponse>), AppError> {
    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let (token, expires) = tokens::create_token(&mut rctx).await?;
    rctx.commit().await?;
    Ok((StatusCode::CREATED, Json(CreateTokenResponse { token, expires })))
}

/// GET /.well-known/jwks.json
pub async fn jwks(State(state): State<AppState>, HostOrg(org): HostOrg) -> Result<Json<JwkSet>, AppError> {
    let mut rctx = state.public_context(&org, TxOptions::read_only()).await?;
    let keys = tokens::jwks(&mut rctx).await?;
    rctx.commit().await?;
    Ok(Json(keys))
}
