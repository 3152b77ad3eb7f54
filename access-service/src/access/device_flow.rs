use super::login::issue_key;
use super::RequestContext;
use crate::data;
use crate::data::device_flow::DEVICE_FLOW_TTL_MINUTES;
use crate::error::ServiceError;
use crate::models::{SCOPE_ALLOW_APPROVE_DEVICE_FLOW, SCOPE_PASSWORD_RESET};
use chrono::Utc;
use service_core::api::{DeviceFlowResponse, DeviceFlowStatus, DevicePollResponse, LoginResponse};
use service_core::error::AppError;
use tracing::{info, instrument};

/// Seconds a device should wait between polls.
pub const POLL_INTERVAL_SECONDS: i64 = 5;

/// Start a pairing. The user enters `user_code` at `verification_uri` on a
/// device where they are signed in.
#[instrument(skip(rctx))]
pub async fn start_device_flow(rctx: &mut RequestContext, base_url: &str) -> Result<DeviceFlowResponse, AppError> {
    let req = data::device_flow::create_device_flow_auth_request(&mut rctx.tx).await?;
    Ok(DeviceFlowResponse {
        device_code: req.device_code,
        user_code: req.user_code,
        verification_uri: format!("{}/device", base_url.trim_end_matches('/')),
        expires_in: DEVICE_FLOW_TTL_MINUTES * 60,
        interval: POLL_INTERVAL_SECONDS,
    })
}

/// Check on a pairing from the device. An approved pairing is handed over
/// once and then deleted.
#[instrument(skip_all)]
pub async fn poll_device_flow(rctx: &mut RequestContext, device_code: &str) -> Result<DevicePollResponse, AppError> {
    let req = data::device_flow::get_by_device_code(&mut rctx.tx, device_code).await?;

    let status = if req.expires_at <= Utc::now() {
        DeviceFlowStatus::Expired
    } else if req.approved {
        DeviceFlowStatus::Confirmed
    } else {
        DeviceFlowStatus::Pending
    };
    if status != DeviceFlowStatus::Confirmed {
        return Ok(DevicePollResponse {
            status,
            device_code: req.device_code,
            login: None,
        });
    }

    let key = data::access_keys::get_access_key(&mut rctx.tx, req.access_key_id).await?;
    let identity = data::identities::get_identity(&mut rctx.tx, key.issued_for).await?;
    let org_id = rctx.org_id()?;
    let organization = data::organizations::get_organization(&mut rctx.tx, org_id).await?;
    data::device_flow::delete(&mut rctx.tx, req.id).await?;

    info!(identity_id = %identity.id, "Device login confirmed");
    Ok(DevicePollResponse {
        status,
        device_code: req.device_code,
        login: Some(LoginResponse {
            user_id: identity.id,
            name: identity.name,
            access_key: req.access_key_token,
            expires: key.expires_at,
            password_update_required: false,
            organization_name: organization.name,
        }),
    })
}

/// Approve a pairing as the caller. The device gets its own key that ends
/// with the caller's session.
#[instrument(skip_all)]
pub async fn approve_device_flow(rctx: &mut RequestContext, user_code: &str) -> Result<(), AppError> {
    let authenticated = rctx.authenticated()?.clone();
    if !authenticated.access_key.has_scope(SCOPE_ALLOW_APPROVE_DEVICE_FLOW) {
        return Err(ServiceError::Forbidden(format!(
            "access key is missing the {} scope",
            SCOPE_ALLOW_APPROVE_DEVICE_FLOW
        ))
        .into());
    }

    let req = data::device_flow::get_by_user_code(&mut rctx.tx, user_code).await?;
    if req.expires_at <= Utc::now() {
        return Err(ServiceError::Expired("device flow request has expired".into()).into());
    }

    let caller_key = &authenticated.access_key;
    let scopes = caller_key
        .scopes
        .iter()
        .filter(|s| s.as_str() != SCOPE_PASSWORD_RESET)
        .cloned()
        .collect();
    let key = issue_key(
        &mut rctx.tx,
        &authenticated.user,
        caller_key.provider_id,
        caller_key.expires_at,
        caller_key.extension_seconds,
        scopes,
    )
    .await?;
    data::device_flow::approve(&mut rctx.tx, req.id, key.id, &key.token()).await?;

    info!(identity_id = %authenticated.user.id, access_key_id = %key.id, "Approved device login");
    Ok(())
}
