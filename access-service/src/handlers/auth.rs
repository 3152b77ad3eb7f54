//! Login, logout, password reset and the device flow.

use axum::{
    extract::{Json, State},
    http::StatusCode,
};
use service_core::api::{
    ApproveDeviceFlowRequest, DeviceFlowResponse, DevicePollResponse, LoginRequest, LoginResponse,
    PasswordResetRequest, PasswordResetTokenResponse, PollDeviceFlowRequest, VerifiedPasswordResetRequest,
};
use service_core::error::AppError;
use validator::Validate;

use super::context::{Deadline, HostOrg};
use crate::access::{device_flow, login};
use crate::db::TxOptions;
use crate::middleware::Auth;
use crate::startup::AppState;
use crate::utils::Password;

/// POST /api/login
pub async fn login(
    State(state): State<AppState>,
    HostOrg(org): HostOrg,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let mut rctx = state.public_context(&org, TxOptions::read_write()).await?;
    let result = login::login(&mut rctx, &req).await?;
    rctx.commit().await?;

    tracing::info!(
        identity_id = %result.identity.id,
        org_id = %result.organization.id,
        "Login succeeded"
    );
    Ok(Json(result.to_api()))
}

/// POST /api/logout
pub async fn logout(State(state): State<AppState>, Auth(auth): Auth) -> Result<StatusCode, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    login::logout(&mut rctx).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/password-reset-request
pub async fn request_password_reset(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<PasswordResetRequest>,
) -> Result<(StatusCode, Json<PasswordResetTokenResponse>), AppError> {
    req.validate()?;

    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    let token = login::create_password_reset_token(&mut rctx, &req.email).await?;
    rctx.commit().await?;

    Ok((
        StatusCode::CREATED,
        Json(PasswordResetTokenResponse {
            token: token.token,
            expires: token.expires_at,
        }),
    ))
}

/// POST /api/password-reset
pub async fn confirm_password_reset(
    State(state): State<AppState>,
    HostOrg(org): HostOrg,
    Json(req): Json<VerifiedPasswordResetRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    req.validate()?;

    let mut rctx = state.public_context(&org, TxOptions::read_write()).await?;
    let password = Password::new(req.password);
    let result = login::complete_password_reset(&mut rctx, &req.token, &password).await?;
    rctx.commit().await?;
    Ok(Json(result.to_api()))
}

/// POST /api/device
pub async fn start_device_flow(
    State(state): State<AppState>,
    HostOrg(org): HostOrg,
) -> Result<(StatusCode, Json<DeviceFlowResponse>), AppError> {
    let mut rctx = state.public_context(&org, TxOptions::read_write()).await?;
    let flow = device_flow::start_device_flow(&mut rctx, &state.config.base_url).await?;
    rctx.commit().await?;
    Ok((StatusCode::CREATED, Json(flow)))
}

/// POST /api/device/status
pub async fn poll_device_flow(
    State(state): State<AppState>,
    HostOrg(org): HostOrg,
    Json(req): Json<PollDeviceFlowRequest>,
) -> Result<Json<DevicePollResponse>, AppError> {
    let mut rctx = state.public_context(&org, TxOptions::read_write()).await?;
    let status = device_flow::poll_device_flow(&mut rctx, &req.device_code).await?;
    rctx.commit().await?;
    Ok(Json(status))
}

/// POST /api/device/approve
pub async fn approve_device_flow(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(req): Json<ApproveDeviceFlowRequest>,
) -> Result<StatusCode, AppError> {
    let mut rctx = state.context(auth, TxOptions::read_write(), Deadline::Request).await?;
    device_flow::approve_device_flow(&mut rctx, &req.user_code).await?;
    rctx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
