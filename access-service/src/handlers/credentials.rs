//! Destination credentials: users ask, connectors long-poll and answer.

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
};
use service_core::api::{
    AnswerDestinationCredentialRequest, CreateDestinationCredentialRequest, DestinationCredential,
    ListDestinationCredentialsQuery, ListResponse,
};
use service_core::error::AppError;
use validator::Validate;

use super::context::Deadline;
use crate::access::destination_credentials;
use crate::db::TxOptions;
use crate::middleware::Auth;
use crate::startup::AppState;

/// POST /api/credentials
///
/// Holds the request open until the destination's connector answers.
pub async fn create_destination_credential(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<CreateDestinationCredentialRequest>,
) -> Result<(StatusCode, Json<DestinationCredential>), AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Blocking).await?;
    let credential = destination_credentials::create_destination_credential(&mut rctx, &req.destination).await?;
    rctx.commit().await?;
    Ok((StatusCode::CREATED, Json(credential.to_api())))
}

/// GET /api/credentials
pub async fn list_destination_credentials(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Query(query): Query<ListDestinationCredentialsQuery>,
) -> Result<Json<ListResponse<DestinationCredential>>, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_only(), Deadline::Blocking).await?;
    let open = destination_credentials::list_destination_credentials(&mut rctx, &query).await?;
    rctx.commit().await?;
    Ok(Json(open))
}

/// PUT /api/credentials
pub async fn answer_destination_credential(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<AnswerDestinationCredentialRequest>,
) -> Result<StatusCode, AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    destination_credentials::answer_destination_credential(&mut rctx, &req).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
