use axum::{
    extract::{Json, State},
    http::StatusCode,
};
use service_core::api::{CreateOrganizationRequest, Organization};
use service_core::error::AppError;
use validator::Validate;

use super::context::Deadline;
use crate::access::organizations;
use crate::db::TxOptions;
use crate::middleware::Auth;
use crate::startup::AppState;

/// POST /api/organizations
pub async fn create_organization(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<CreateOrganizationRequest>,
) -> Result<(StatusCode, Json<Organization>), AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let org = organizations::create_organization(&mut rctx, &req).await?;
    rctx.commit().await?;
    Ok((StatusCode::CREATED, Json(org.to_api())))
}
