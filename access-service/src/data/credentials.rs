use crate::crypto::random_alphanumeric;
use crate::db::Transaction;
use crate::models::{Credential, PasswordResetToken};
use chrono::{Duration, Utc};
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::instrument;

pub const RESET_TOKEN_LEN: usize = 10;
pub const RESET_TOKEN_TTL_MINUTES: i64 = 10;

const CREDENTIAL_COLUMNS: &str = "id, organization_id, identity_id, password_hash, one_time_password";

#[instrument(skip(tx, credential), fields(identity_id = %credential.identity_id))]
pub async fn create_credential(tx: &mut Transaction, credential: &mut Credential) -> Result<(), AppError> {
    if credential.password_hash.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("password hash is required")));
    }
    credential.organization_id = tx.org_id()?;
    sqlx::query(
        r#"
        INSERT INTO credentials (id, organization_id, identity_id, password_hash, one_time_password)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(credential.id)
    .bind(credential.organization_id)
    .bind(credential.identity_id)
    .bind(&credential.password_hash)
    .bind(credential.one_time_password)
    .execute(tx.conn())
    .await?;
    Ok(())
}

pub async fn get_credential_by_identity(
    tx: &mut Transaction,
    identity_id: Id,
) -> Result<Credential, AppError> {
    let org_id = tx.org_id()?;
    let credential = sqlx::query_as::<_, Credential>(&format!(
        "SELECT {} FROM credentials WHERE organization_id = $1 AND identity_id = $2 AND deleted_at IS NULL",
        CREDENTIAL_COLUMNS
    ))
    .bind(org_id)
    .bind(identity_id)
    .fetch_optional(tx.conn())
    .await?;
    credential.ok_or_else(|| AppError::NotFound(anyhow::anyhow!("credential not found")))
}

#[instrument(skip(tx, credential), fields(identity_id = %credential.identity_id))]
pub async fn update_credential(tx: &mut Transaction, credential: &Credential) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    sqlx::query(
        r#"
        UPDATE credentials SET password_hash = $3, one_time_password = $4, updated_at = $5
        WHERE organization_id = $1 AND id = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(org_id)
    .bind(credential.id)
    .bind(&credential.password_hash)
    .bind(credential.one_time_password)
    .bind(Utc::now())
    .execute(tx.conn())
    .await?;
    Ok(())
}

pub async fn delete_credential(tx: &mut Transaction, identity_id: Id) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    sqlx::query(
        "UPDATE credentials SET deleted_at = $3 WHERE organization_id = $1 AND identity_id = $2 AND deleted_at IS NULL",
    )
    .bind(org_id)
    .bind(identity_id)
    .bind(Utc::now())
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Mint a single-use reset token for `identity_id`.
#[instrument(skip(tx))]
pub async fn create_password_reset_token(
    tx: &mut Transaction,
    identity_id: Id,
) -> Result<PasswordResetToken, AppError> {
    let token = PasswordResetToken {
        id: Id::generate(),
        organization_id: tx.org_id()?,
        token: random_alphanumeric(RESET_TOKEN_LEN),
        identity_id,
        expires_at: Utc::now() + Duration::minutes(RESET_TOKEN_TTL_MINUTES),
    };
    sqlx::query(
        r#"
        INSERT INTO password_reset_tokens (id, organization_id, token, identity_id, expires_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(token.id)
    .bind(token.organization_id)
    .bind(&token.token)
    .bind(token.identity_id)
    .bind(token.expires_at)
    .execute(tx.conn())
    .await?;
    Ok(token)
}

/// Delete the token and return the identity it was issued for. A missing or
/// aged-out token is `Expired`.
#[instrument(skip_all)]
pub async fn claim_password_reset_token(tx: &mut Transaction, token: &str) -> Result<Id, AppError> {
    let org_id = tx.org_id()?;
    let claimed: Option<Id> = sqlx::query_scalar(
        r#"
        DELETE FROM password_reset_tokens
        WHERE organization_id = $1 AND token = $2 AND expires_at > $3
        RETURNING identity_id
        "#,
    )
    .bind(org_id)
    .bind(token)
    .bind(Utc::now())
    .fetch_optional(tx.conn())
    .await?;
    claimed.ok_or_else(|| AppError::Expired("password reset token is invalid or expired".into()))
}

pub async fn remove_expired_password_reset_tokens(tx: &mut Transaction) -> Result<u64, AppError> {
    let result = sqlx::query("DELETE FROM password_reset_tokens WHERE expires_at <= $1")
        .bind(Utc::now())
        .execute(tx.conn())
        .await?;
    Ok(result.rows_affected())
}
