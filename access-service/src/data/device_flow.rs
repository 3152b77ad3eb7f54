use crate::crypto::{random_alphanumeric, random_from_alphabet};
use crate::db::Transaction;
use crate::models::device_flow::{
    is_valid_device_code, is_valid_user_code, DEVICE_CODE_LEN, USER_CODE_ALPHABET, USER_CODE_LEN,
};
use crate::models::DeviceFlowAuthRequest;
use chrono::{Duration, Utc};
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::instrument;

use super::{seal_field, unseal_field};

pub const DEVICE_FLOW_TTL_MINUTES: i64 = 30;

const COLUMNS: &str =
    "id, organization_id, user_code, device_code, approved, access_key_id, access_key_token, expires_at";

fn open(tx: &Transaction, mut req: DeviceFlowAuthRequest) -> Result<DeviceFlowAuthRequest, AppError> {
    req.access_key_token = unseal_field(tx, &req.access_key_token)?;
    Ok(req)
}

#[instrument(skip(tx))]
pub async fn create_device_flow_auth_request(
    tx: &mut Transaction,
) -> Result<DeviceFlowAuthRequest, AppError> {
    let req = DeviceFlowAuthRequest {
        id: Id::generate(),
        organization_id: tx.org_id()?,
        user_code: random_from_alphabet(USER_CODE_LEN, USER_CODE_ALPHABET),
        device_code: random_alphanumeric(DEVICE_CODE_LEN),
        approved: false,
        access_key_id: Id::default(),
        access_key_token: String::new(),
        expires_at: Utc::now() + Duration::minutes(DEVICE_FLOW_TTL_MINUTES),
    };
    if !is_valid_user_code(&req.user_code) || !is_valid_device_code(&req.device_code) {
        return Err(AppError::InternalError(anyhow::anyhow!(
            "generated device flow codes are malformed"
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO device_flow_auth_requests (id, organization_id, user_code, device_code, approved, expires_at)
        VALUES ($1, $2, $3, $4, FALSE, $5)
        "#,
    )
    .bind(req.id)
    .bind(req.organization_id)
    .bind(&req.user_code)
    .bind(&req.device_code)
    .bind(req.expires_at)
    .execute(tx.conn())
    .await?;
    Ok(req)
}

pub async fn get_by_device_code(
    tx: &mut Transaction,
    device_code: &str,
) -> Result<DeviceFlowAuthRequest, AppError> {
    if !is_valid_device_code(device_code) {
        return Err(AppError::NotFound(anyhow::anyhow!("device code not found")));
    }
    let org_id = tx.org_id()?;
    let req = sqlx::query_as::<_, DeviceFlowAuthRequest>(&format!(
        "SELECT {} FROM device_flow_auth_requests WHERE organization_id = $1 AND device_code = $2 AND deleted_at IS NULL",
        COLUMNS
    ))
    .bind(org_id)
    .bind(device_code)
    .fetch_optional(tx.conn())
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("device code not found")))?;
    open(tx, req)
}

pub async fn get_by_user_code(
    tx: &mut Transaction,
    user_code: &str,
) -> Result<DeviceFlowAuthRequest, AppError> {
    if !is_valid_user_code(user_code) {
        return Err(AppError::NotFound(anyhow::anyhow!("user code not found")));
    }
    let org_id = tx.org_id()?;
    let req = sqlx::query_as::<_, DeviceFlowAuthRequest>(&format!(
        "SELECT {} FROM device_flow_auth_requests WHERE organization_id = $1 AND user_code = $2 AND deleted_at IS NULL",
        COLUMNS
    ))
    .bind(org_id)
    .bind(user_code)
    .fetch_optional(tx.conn())
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("user code not found")))?;
    open(tx, req)
}

/// Attach a freshly minted access key and mark the request approved.
#[instrument(skip(tx, access_key_token))]
pub async fn approve(
    tx: &mut Transaction,
    id: Id,
    access_key_id: Id,
    access_key_token: &str,
) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    let sealed = seal_field(tx, access_key_token)?;
    let result = sqlx::query(
        r#"
        UPDATE device_flow_auth_requests
        SET approved = TRUE, access_key_id = $3, access_key_token = $4, updated_at = $5
        WHERE organization_id = $1 AND id = $2 AND approved = FALSE AND deleted_at IS NULL
        "#,
    )
    .bind(org_id)
    .bind(id)
    .bind(access_key_id)
    .bind(sealed)
    .bind(Utc::now())
    .execute(tx.conn())
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "device flow request was already approved"
        )));
    }
    Ok(())
}

pub async fn delete(tx: &mut Transaction, id: Id) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    sqlx::query("DELETE FROM device_flow_auth_requests WHERE organization_id = $1 AND id = $2")
        .bind(org_id)
        .bind(id)
        .execute(tx.conn())
        .await?;
    Ok(())
}

/// Hard delete requests that aged out or were already soft deleted.
pub async fn delete_expired(tx: &mut Transaction) -> Result<u64, AppError> {
    let result = sqlx::query(
        "DELETE FROM device_flow_auth_requests WHERE expires_at <= $1 OR deleted_at IS NOT NULL",
    )
    .bind(Utc::now())
    .execute(tx.conn())
    .await?;
    Ok(result.rows_affected())
}
