use crate::crypto::random_alphanumeric;
use crate::db::Transaction;
use crate::models::access_key::{split_token, KEY_ID_LEN, SECRET_LEN};
use crate::models::AccessKey;
use crate::services::metrics::{record_access_key_validation, DB_QUERY_DURATION};
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use service_core::uid::Id;
use service_core::utils::constant_time_eq;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

const ACCESS_KEY_COLUMNS: &str = "a.id, a.organization_id, a.created_at, a.updated_at, a.name, a.issued_for, \
     a.provider_id, a.key_id, a.secret_checksum, a.expires_at, a.extension_seconds, \
     a.extension_deadline, a.scopes";

/// Default lifetime when the caller gives none.
pub const DEFAULT_KEY_LIFETIME_HOURS: i64 = 12;

/// An extension write is skipped unless it moves the deadline by more than this.
const EXTENSION_WRITE_THRESHOLD_SECS: i64 = 2;

#[derive(Debug, Clone, Default)]
pub struct ListAccessKeysOptions {
    pub by_issued_for: Option<Id>,
    pub by_name: Option<String>,
    pub include_expired: bool,
}

#[derive(Debug, Clone)]
pub enum DeleteAccessKeys {
    ById(Id),
    ByName(String),
    ByIssuedFor(Id),
    ByProviderAndIssuedFor { provider_id: Id, issued_for: Id },
}

fn checksum(secret: &str) -> Vec<u8> {
    Sha256::digest(secret.as_bytes()).to_vec()
}

/// Fill in generated halves and defaults, then store the key.
///
/// On return `key.secret` holds the only copy of the secret; the table keeps
/// just its checksum.
#[instrument(skip(tx, key), fields(issued_for = %key.issued_for))]
pub async fn create_access_key(tx: &mut Transaction, key: &mut AccessKey) -> Result<(), AppError> {
    if key.issued_for.is_zero() {
        return Err(AppError::BadRequest(anyhow::anyhow!("issued for is required")));
    }
    let timer = DB_QUERY_DURATION
        .with_label_values(&["create_access_key"])
        .start_timer();

    let now = Utc::now();
    if key.id.is_zero() {
        key.id = Id::generate();
    }
    key.organization_id = tx.org_id()?;
    key.created_at = now;
    key.updated_at = now;

    if key.key_id.is_empty() {
        key.key_id = random_alphanumeric(KEY_ID_LEN);
    }
    if key.secret.is_empty() {
        key.secret = random_alphanumeric(SECRET_LEN);
    }
    if key.key_id.len() != KEY_ID_LEN || key.secret.len() != SECRET_LEN {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "access key must be {} characters, a dot, and {} characters",
            KEY_ID_LEN,
            SECRET_LEN
        )));
    }
    key.secret_checksum = checksum(&key.secret);

    if key.expires_at.timestamp() <= 0 {
        key.expires_at = now + Duration::hours(DEFAULT_KEY_LIFETIME_HOURS);
    }
    if key.name.is_empty() {
        key.name = format!("{}-{}", key.issued_for_name_or_id(), key.id);
    }
    if key.extension_seconds > 0 && key.extension_deadline.is_none() {
        key.extension_deadline = Some(now + Duration::seconds(key.extension_seconds));
    }
    if let Some(deadline) = key.extension_deadline {
        if deadline > key.expires_at {
            key.extension_deadline = Some(key.expires_at);
        }
    }

    sqlx::query(
        r#"
        INSERT INTO access_keys (id, organization_id, created_at, updated_at, name, issued_for, provider_id,
            key_id, secret_checksum, expires_at, extension_seconds, extension_deadline, scopes)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(key.id)
    .bind(key.organization_id)
    .bind(key.created_at)
    .bind(key.updated_at)
    .bind(&key.name)
    .bind(key.issued_for)
    .bind(key.provider_id)
    .bind(&key.key_id)
    .bind(&key.secret_checksum)
    .bind(key.expires_at)
    .bind(key.extension_seconds)
    .bind(key.extension_deadline)
    .bind(&key.scopes)
    .execute(tx.conn())
    .await?;

    timer.observe_duration();
    Ok(())
}

pub async fn get_access_key(tx: &mut Transaction, id: Id) -> Result<AccessKey, AppError> {
    let org_id = tx.org_id()?;
    let key = sqlx::query_as::<_, AccessKey>(&format!(
        r#"
        SELECT {}, COALESCE(i.name, '') AS issued_for_name
        FROM access_keys a LEFT JOIN identities i ON i.id = a.issued_for
        WHERE a.organization_id = $1 AND a.id = $2 AND a.deleted_at IS NULL
        "#,
        ACCESS_KEY_COLUMNS
    ))
    .bind(org_id)
    .bind(id)
    .fetch_optional(tx.conn())
    .await?;
    key.ok_or_else(|| AppError::NotFound(anyhow::anyhow!("access key not found")))
}

/// Look a key up by its public half. Not org-scoped: the key is what tells
/// us the organization.
async fn get_access_key_by_key_id(
    tx: &mut Transaction,
    key_id: &str,
) -> Result<Option<AccessKey>, AppError> {
    let key = sqlx::query_as::<_, AccessKey>(&format!(
        r#"
        SELECT {}, COALESCE(i.name, '') AS issued_for_name
        FROM access_keys a LEFT JOIN identities i ON i.id = a.issued_for
        WHERE a.key_id = $1 AND a.deleted_at IS NULL
        "#,
        ACCESS_KEY_COLUMNS
    ))
    .bind(key_id)
    .fetch_optional(tx.conn())
    .await?;
    Ok(key)
}

/// Check a bearer token and slide its inactivity window. Binds the
/// transaction to the key's organization on success.
#[instrument(skip_all)]
pub async fn validate_access_key(tx: &mut Transaction, token: &str) -> Result<AccessKey, AppError> {
    let invalid = || AppError::Unauthorized(anyhow::anyhow!("invalid access key"));

    let (key_id, secret) = split_token(token).ok_or_else(|| {
        record_access_key_validation("malformed");
        invalid()
    })?;
    let Some(mut key) = get_access_key_by_key_id(tx, key_id).await? else {
        record_access_key_validation("unknown");
        return Err(invalid());
    };
    if !constant_time_eq(&checksum(secret), &key.secret_checksum) {
        record_access_key_validation("mismatch");
        return Err(invalid());
    }

    let now = Utc::now();
    check_expiry(&key, now).inspect_err(|_| record_access_key_validation("expired"))?;

    if let Some(deadline) = next_extension_deadline(&key, now) {
        sqlx::query(
            "UPDATE access_keys SET extension_deadline = $3, updated_at = $4 WHERE organization_id = $1 AND id = $2",
        )
        .bind(key.organization_id)
        .bind(key.id)
        .bind(deadline)
        .bind(now)
        .execute(tx.conn())
        .await?;
        debug!(key_id = %key.id, %deadline, "Extended access key");
        key.extension_deadline = Some(deadline);
    }

    tx.bind_org(key.organization_id);
    record_access_key_validation("ok");
    Ok(key)
}

fn check_expiry(key: &AccessKey, now: DateTime<Utc>) -> Result<(), AppError> {
    if now > key.expires_at {
        return Err(AppError::AccessKeyExpired);
    }
    if let Some(deadline) = key.extension_deadline {
        if now > deadline {
            return Err(AppError::AccessKeyDeadlineExceeded);
        }
    }
    Ok(())
}

/// The slid deadline, capped at `expires_at`, when it moves far enough to be
/// worth writing.
fn next_extension_deadline(key: &AccessKey, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if key.extension_seconds <= 0 {
        return None;
    }
    let next = (now + Duration::seconds(key.extension_seconds)).min(key.expires_at);
    match key.extension_deadline {
        Some(current) if next - current <= Duration::seconds(EXTENSION_WRITE_THRESHOLD_SECS) => None,
        _ => Some(next),
    }
}

#[instrument(skip(tx))]
pub async fn list_access_keys(
    tx: &mut Transaction,
    opts: &ListAccessKeysOptions,
) -> Result<Vec<AccessKey>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["list_access_keys"])
        .start_timer();
    let org_id = tx.org_id()?;

    let keys = sqlx::query_as::<_, AccessKey>(&format!(
        r#"
        SELECT {}, COALESCE(i.name, '') AS issued_for_name
        FROM access_keys a LEFT JOIN identities i ON i.id = a.issued_for
        WHERE a.organization_id = $1 AND a.deleted_at IS NULL
          AND ($2::bigint IS NULL OR a.issued_for = $2)
          AND ($3::text IS NULL OR a.name = $3)
          AND ($4 OR (a.expires_at > $5 AND (a.extension_deadline IS NULL OR a.extension_deadline > $5)))
        ORDER BY a.name ASC
        "#,
        ACCESS_KEY_COLUMNS
    ))
    .bind(org_id)
    .bind(opts.by_issued_for)
    .bind(opts.by_name.as_deref())
    .bind(opts.include_expired)
    .bind(Utc::now())
    .fetch_all(tx.conn())
    .await?;

    timer.observe_duration();
    Ok(keys)
}

/// Remove one scope from a key, e.g. `password-reset` once the password is set.
pub async fn remove_scope(tx: &mut Transaction, id: Id, scope: &str) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    sqlx::query(
        "UPDATE access_keys SET scopes = array_remove(scopes, $3), updated_at = $4 \
         WHERE organization_id = $1 AND id = $2",
    )
    .bind(org_id)
    .bind(id)
    .bind(scope)
    .bind(Utc::now())
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Soft delete matching keys. Deleting nothing is not an error.
#[instrument(skip(tx))]
pub async fn delete_access_keys(tx: &mut Transaction, by: DeleteAccessKeys) -> Result<u64, AppError> {
    let org_id = tx.org_id()?;
    let (id, name, issued_for, provider_id) = match by {
        DeleteAccessKeys::ById(id) => (Some(id), None, None, None),
        DeleteAccessKeys::ByName(name) => (None, Some(name), None, None),
        DeleteAccessKeys::ByIssuedFor(issued_for) => (None, None, Some(issued_for), None),
        DeleteAccessKeys::ByProviderAndIssuedFor {
            provider_id,
            issued_for,
        } => (None, None, Some(issued_for), Some(provider_id)),
    };

    let result = sqlx::query(
        r#"
        UPDATE access_keys SET deleted_at = $2
        WHERE organization_id = $1 AND deleted_at IS NULL
          AND ($3::bigint IS NULL OR id = $3)
          AND ($4::text IS NULL OR name = $4)
          AND ($5::bigint IS NULL OR issued_for = $5)
          AND ($6::bigint IS NULL OR provider_id = $6)
        "#,
    )
    .bind(org_id)
    .bind(Utc::now())
    .bind(id)
    .bind(name)
    .bind(issued_for)
    .bind(provider_id)
    .execute(tx.conn())
    .await?;
    Ok(result.rows_affected())
}

/// Hard delete keys past their hard expiry, in every organization.
pub async fn remove_expired_access_keys(tx: &mut Transaction) -> Result<u64, AppError> {
    let result = sqlx::query("DELETE FROM access_keys WHERE expires_at <= $1")
        .bind(Utc::now())
        .execute(tx.conn())
        .await?;
    Ok(result.rows_affected())
}

impl AccessKey {
    fn issued_for_name_or_id(&self) -> String {
        if self.issued_for_name.is_empty() {
            self.issued_for.to_string()
        } else {
            self.issued_for_name.clone()
        }
    }
}
