use crate::db::Transaction;
use crate::models::{Identity, CONNECTOR_IDENTITY_NAME};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use service_core::subject::Subject;
use service_core::uid::Id;
use tracing::instrument;

use super::{access_keys, credentials, grants, groups, providers};

const IDENTITY_COLUMNS: &str =
    "i.id, i.organization_id, i.created_at, i.updated_at, i.name, i.last_seen_at, i.created_by, i.verified";

/// Minimum gap between two `last_seen_at` writes for one identity.
pub const LAST_SEEN_THROTTLE: i64 = 2;

#[derive(Debug, Clone, Default)]
pub struct ListIdentitiesOptions {
    pub by_name: Option<String>,
    pub by_group: Option<Id>,
    pub by_ids: Vec<Id>,
    /// Include the connector identity.
    pub show_system: bool,
}

#[instrument(skip(tx, identity), fields(name = %identity.name))]
pub async fn create_identity(tx: &mut Transaction, identity: &mut Identity) -> Result<(), AppError> {
    if identity.name.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("name is required")));
    }
    let timer = DB_QUERY_DURATION
        .with_label_values(&["create_identity"])
        .start_timer();

    identity.organization_id = tx.org_id()?;
    sqlx::query(
        r#"
        INSERT INTO identities (id, organization_id, created_at, updated_at, name, last_seen_at, created_by, verified)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(identity.id)
    .bind(identity.organization_id)
    .bind(identity.created_at)
    .bind(identity.updated_at)
    .bind(&identity.name)
    .bind(identity.last_seen_at)
    .bind(identity.created_by)
    .bind(identity.verified)
    .execute(tx.conn())
    .await?;

    timer.observe_duration();
    Ok(())
}

pub async fn get_identity(tx: &mut Transaction, id: Id) -> Result<Identity, AppError> {
    let org_id = tx.org_id()?;
    let identity = sqlx::query_as::<_, Identity>(&format!(
        "SELECT {} FROM identities i WHERE i.organization_id = $1 AND i.id = $2 AND i.deleted_at IS NULL",
        IDENTITY_COLUMNS
    ))
    .bind(org_id)
    .bind(id)
    .fetch_optional(tx.conn())
    .await?;
    identity.ok_or_else(|| AppError::NotFound(anyhow::anyhow!("user not found")))
}

pub async fn get_identity_by_name(tx: &mut Transaction, name: &str) -> Result<Identity, AppError> {
    let org_id = tx.org_id()?;
    let identity = sqlx::query_as::<_, Identity>(&format!(
        "SELECT {} FROM identities i WHERE i.organization_id = $1 AND i.name = $2 AND i.deleted_at IS NULL",
        IDENTITY_COLUMNS
    ))
    .bind(org_id)
    .bind(name)
    .fetch_optional(tx.conn())
    .await?;
    identity.ok_or_else(|| AppError::NotFound(anyhow::anyhow!("user not found")))
}

#[instrument(skip(tx))]
pub async fn list_identities(
    tx: &mut Transaction,
    opts: &ListIdentitiesOptions,
) -> Result<Vec<Identity>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["list_identities"])
        .start_timer();
    let org_id = tx.org_id()?;
    let ids: Option<Vec<Id>> = (!opts.by_ids.is_empty()).then(|| opts.by_ids.clone());

    let identities = sqlx::query_as::<_, Identity>(&format!(
        r#"
        SELECT {} FROM identities i
        WHERE i.organization_id = $1 AND i.deleted_at IS NULL
          AND ($2::text IS NULL OR i.name = $2)
          AND ($3::bigint IS NULL OR EXISTS (
                SELECT 1 FROM identities_groups m WHERE m.identity_id = i.id AND m.group_id = $3))
          AND ($4::bigint[] IS NULL OR i.id = ANY($4))
          AND ($5 OR i.name <> $6)
        ORDER BY i.name ASC
        "#,
        IDENTITY_COLUMNS
    ))
    .bind(org_id)
    .bind(opts.by_name.as_deref())
    .bind(opts.by_group)
    .bind(ids)
    .bind(opts.show_system)
    .bind(CONNECTOR_IDENTITY_NAME)
    .fetch_all(tx.conn())
    .await?;

    timer.observe_duration();
    Ok(identities)
}

/// Delete identities and everything hanging off them: grants they hold,
/// group memberships, access keys, passwords and provider records.
#[instrument(skip(tx, ids), fields(count = ids.len()))]
pub async fn delete_identities(tx: &mut Transaction, ids: &[Id]) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    for &id in ids {
        grants::delete_grants(tx, grants::DeleteGrants::BySubject(Subject::User(id))).await?;
        groups::remove_identity_from_all_groups(tx, id).await?;
        access_keys::delete_access_keys(tx, access_keys::DeleteAccessKeys::ByIssuedFor(id))
            .await?;
        credentials::delete_credential(tx, id).await?;
        providers::delete_provider_users_for_identity(tx, id).await?;

        sqlx::query(
            "UPDATE identities SET deleted_at = $3 WHERE organization_id = $1 AND id = $2 AND deleted_at IS NULL",
        )
        .bind(org_id)
        .bind(id)
        .bind(Utc::now())
        .execute(tx.conn())
        .await?;
    }
    Ok(())
}

/// Record activity, at most once per [`LAST_SEEN_THROTTLE`] minutes.
pub async fn touch_last_seen(
    tx: &mut Transaction,
    identity: &mut Identity,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let fresh = identity
        .last_seen_at
        .map(|seen| now - seen < Duration::minutes(LAST_SEEN_THROTTLE))
        .unwrap_or(false);
    if fresh {
        return Ok(());
    }
    sqlx::query("UPDATE identities SET last_seen_at = $3 WHERE organization_id = $1 AND id = $2")
        .bind(identity.organization_id)
        .bind(identity.id)
        .bind(now)
        .execute(tx.conn())
        .await?;
    identity.last_seen_at = Some(now);
    Ok(())
}

pub async fn set_verified(tx: &mut Transaction, id: Id) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    sqlx::query("UPDATE identities SET verified = TRUE, updated_at = $3 WHERE organization_id = $1 AND id = $2")
        .bind(org_id)
        .bind(id)
        .bind(Utc::now())
        .execute(tx.conn())
        .await?;
    Ok(())
}
