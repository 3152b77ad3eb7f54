use crate::db::Transaction;
use crate::models::DestinationCredential;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::instrument;

use super::{seal_field, unseal_field};

/// How long a request waits for a connector to answer.
pub const REQUEST_TTL_MINUTES: i64 = 2;

const COLUMNS: &str = "id, organization_id, user_id, destination_id, request_expires_at, update_index, \
     answered, credential_expires_at, bearer_token";

fn open(tx: &Transaction, mut cred: DestinationCredential) -> Result<DestinationCredential, AppError> {
    if let Some(token) = cred.bearer_token.take() {
        cred.bearer_token = Some(unseal_field(tx, &token)?);
    }
    Ok(cred)
}

/// Insert an open request for `user_id` on `destination_id`.
#[instrument(skip(tx))]
pub async fn create_destination_credential(
    tx: &mut Transaction,
    user_id: Id,
    destination_id: Id,
) -> Result<DestinationCredential, AppError> {
    let mut cred = DestinationCredential {
        id: Id::generate(),
        organization_id: tx.org_id()?,
        user_id,
        destination_id,
        request_expires_at: Utc::now() + Duration::minutes(REQUEST_TTL_MINUTES),
        update_index: 0,
        answered: false,
        credential_expires_at: None,
        bearer_token: None,
    };
    cred.update_index = sqlx::query_scalar(
        r#"
        INSERT INTO destination_credentials (id, organization_id, user_id, destination_id, request_expires_at,
            update_index, answered)
        VALUES ($1, $2, $3, $4, $5, nextval('seq_update_index'), FALSE)
        RETURNING update_index
        "#,
    )
    .bind(cred.id)
    .bind(cred.organization_id)
    .bind(cred.user_id)
    .bind(cred.destination_id)
    .bind(cred.request_expires_at)
    .fetch_one(tx.conn())
    .await?;
    Ok(cred)
}

pub async fn get_destination_credential(
    tx: &mut Transaction,
    id: Id,
) -> Result<DestinationCredential, AppError> {
    let org_id = tx.org_id()?;
    let cred = sqlx::query_as::<_, DestinationCredential>(&format!(
        "SELECT {} FROM destination_credentials WHERE organization_id = $1 AND id = $2",
        COLUMNS
    ))
    .bind(org_id)
    .bind(id)
    .fetch_optional(tx.conn())
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("destination credential not found")))?;
    open(tx, cred)
}

/// Unanswered, unexpired requests for one destination, plus the highest update
/// index among them (1 when there are none).
#[instrument(skip(tx))]
pub async fn list_open_destination_credentials(
    tx: &mut Transaction,
    destination_id: Id,
    now: DateTime<Utc>,
) -> Result<(Vec<DestinationCredential>, i64), AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["list_destination_credentials"])
        .start_timer();
    let org_id = tx.org_id()?;
    let creds = sqlx::query_as::<_, DestinationCredential>(&format!(
        r#"
        SELECT {} FROM destination_credentials
        WHERE organization_id = $1 AND destination_id = $2 AND answered = FALSE AND request_expires_at >= $3
        ORDER BY update_index ASC
        "#,
        COLUMNS
    ))
    .bind(org_id)
    .bind(destination_id)
    .bind(now)
    .fetch_all(tx.conn())
    .await?;
    timer.observe_duration();

    let max_index = creds.iter().map(|c| c.update_index).max().unwrap_or(1);
    Ok((creds, max_index))
}

/// Record a connector's answer. Only the first answer for a request sticks;
/// later ones match no row and return false.
#[instrument(skip(tx, bearer_token))]
pub async fn answer_destination_credential(
    tx: &mut Transaction,
    id: Id,
    bearer_token: &str,
    credential_expires_at: DateTime<Utc>,
) -> Result<bool, AppError> {
    if bearer_token.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("bearerToken is required")));
    }
    let org_id = tx.org_id()?;
    let sealed = seal_field(tx, bearer_token)?;
    let result = sqlx::query(
        r#"
        UPDATE destination_credentials
        SET answered = TRUE, bearer_token = $3, credential_expires_at = $4
        WHERE organization_id = $1 AND id = $2 AND answered = FALSE
        "#,
    )
    .bind(org_id)
    .bind(id)
    .bind(sealed)
    .bind(credential_expires_at)
    .execute(tx.conn())
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn remove_expired_destination_credentials(tx: &mut Transaction) -> Result<u64, AppError> {
    let result = sqlx::query("DELETE FROM destination_credentials WHERE request_expires_at < $1")
        .bind(Utc::now())
        .execute(tx.conn())
        .await?;
    Ok(result.rows_affected())
}
