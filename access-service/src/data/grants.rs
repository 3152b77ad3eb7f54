use crate::db::Transaction;
use crate::models::{Grant, CONNECTOR_ROLE, INFRA_RESOURCE};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::Utc;
use service_core::error::AppError;
use service_core::subject::Subject;
use service_core::uid::Id;
use tracing::instrument;

use super::groups;

const GRANT_COLUMNS: &str =
    "id, organization_id, created_at, updated_at, subject, privilege, resource, created_by, update_index";

#[derive(Debug, Clone, Default)]
pub struct ListGrantsOptions {
    pub by_subject: Option<Subject>,
    /// With a user subject, also match grants held by the user's groups.
    pub include_inherited_from_groups: bool,
    pub by_privileges: Vec<String>,
    pub by_resource: Option<String>,
    /// Grants on the destination or any of its sub-resources.
    pub by_destination: Option<String>,
    pub exclude_connector_grant: bool,
}

fn validate(grant: &Grant) -> Result<(), AppError> {
    if grant.privilege.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("privilege is required")));
    }
    if grant.resource.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("resource is required")));
    }
    if grant.subject.id().is_zero() {
        return Err(AppError::BadRequest(anyhow::anyhow!("subject is required")));
    }
    Ok(())
}

/// Insert `grant`. Returns false, leaving the transaction usable, when an
/// identical live grant already exists.
#[instrument(skip(tx, grant), fields(subject = %grant.subject, privilege = %grant.privilege, resource = %grant.resource))]
pub async fn create_grant(tx: &mut Transaction, grant: &mut Grant) -> Result<bool, AppError> {
    validate(grant)?;
    let timer = DB_QUERY_DURATION
        .with_label_values(&["create_grant"])
        .start_timer();

    grant.organization_id = tx.org_id()?;
    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO grants (id, organization_id, created_at, updated_at, subject, privilege, resource, created_by, update_index)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, nextval('seq_update_index'))
        ON CONFLICT DO NOTHING
        RETURNING update_index
        "#,
    )
    .bind(grant.id)
    .bind(grant.organization_id)
    .bind(grant.created_at)
    .bind(grant.updated_at)
    .bind(grant.subject)
    .bind(&grant.privilege)
    .bind(&grant.resource)
    .bind(grant.created_by)
    .fetch_optional(tx.conn())
    .await?;

    timer.observe_duration();
    match inserted {
        Some(update_index) => {
            grant.update_index = update_index;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub async fn get_grant(tx: &mut Transaction, id: Id) -> Result<Grant, AppError> {
    let org_id = tx.org_id()?;
    let grant = sqlx::query_as::<_, Grant>(&format!(
        "SELECT {} FROM grants WHERE organization_id = $1 AND id = $2 AND deleted_at IS NULL",
        GRANT_COLUMNS
    ))
    .bind(org_id)
    .bind(id)
    .fetch_optional(tx.conn())
    .await?;
    grant.ok_or_else(|| AppError::NotFound(anyhow::anyhow!("grant not found")))
}

/// The live grant matching `(subject, privilege, resource)`, if any.
pub async fn find_grant(
    tx: &mut Transaction,
    subject: Subject,
    privilege: &str,
    resource: &str,
) -> Result<Option<Grant>, AppError> {
    let org_id = tx.org_id()?;
    let grant = sqlx::query_as::<_, Grant>(&format!(
        r#"
        SELECT {} FROM grants
        WHERE organization_id = $1 AND deleted_at IS NULL
          AND subject = $2 AND privilege = $3 AND resource = $4
        "#,
        GRANT_COLUMNS
    ))
    .bind(org_id)
    .bind(subject)
    .bind(privilege)
    .bind(resource)
    .fetch_optional(tx.conn())
    .await?;
    Ok(grant)
}

#[instrument(skip(tx))]
pub async fn list_grants(
    tx: &mut Transaction,
    opts: &ListGrantsOptions,
) -> Result<Vec<Grant>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["list_grants"])
        .start_timer();
    let org_id = tx.org_id()?;

    let subjects: Option<Vec<String>> = match opts.by_subject {
        None => None,
        Some(subject) if opts.include_inherited_from_groups => {
            let user_id = subject.identity_id().ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "inherited grants can only be listed for a user"
                ))
            })?;
            let mut subjects = vec![subject.to_string()];
            for group_id in groups::group_ids_for_identity(tx, user_id).await? {
                subjects.push(Subject::Group(group_id).to_string());
            }
            Some(subjects)
        }
        Some(subject) => Some(vec![subject.to_string()]),
    };
    let privileges = (!opts.by_privileges.is_empty()).then(|| opts.by_privileges.clone());

    let grants = sqlx::query_as::<_, Grant>(&format!(
        r#"
        SELECT {} FROM grants
        WHERE organization_id = $1 AND deleted_at IS NULL
          AND ($2::text[] IS NULL OR subject = ANY($2))
          AND ($3::text[] IS NULL OR privilege = ANY($3))
          AND ($4::text IS NULL OR resource = $4)
          AND ($5::text IS NULL OR split_part(resource, '.', 1) = $5)
          AND (NOT $6 OR NOT (privilege = $7 AND resource = $8))
        ORDER BY id ASC
        "#,
        GRANT_COLUMNS
    ))
    .bind(org_id)
    .bind(subjects)
    .bind(privileges)
    .bind(opts.by_resource.as_deref())
    .bind(opts.by_destination.as_deref())
    .bind(opts.exclude_connector_grant)
    .bind(CONNECTOR_ROLE)
    .bind(INFRA_RESOURCE)
    .fetch_all(tx.conn())
    .await?;

    timer.observe_duration();
    Ok(grants)
}

/// Highest update index over every grant, live or deleted, on `destination`
/// or its sub-resources. 1 when there are none.
pub async fn grants_max_update_index(
    tx: &mut Transaction,
    destination: &str,
) -> Result<i64, AppError> {
    let org_id = tx.org_id()?;
    let max: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT MAX(update_index) FROM grants
        WHERE organization_id = $1 AND split_part(resource, '.', 1) = $2
        "#,
    )
    .bind(org_id)
    .bind(destination)
    .fetch_one(tx.conn())
    .await?;
    Ok(max.unwrap_or(1))
}

/// True when `subject` holds `privilege` on `resource` directly.
pub async fn has_grant(
    tx: &mut Transaction,
    subjects: &[Subject],
    privilege: &str,
    resource: &str,
) -> Result<bool, AppError> {
    let org_id = tx.org_id()?;
    let subjects: Vec<String> = subjects.iter().map(ToString::to_string).collect();
    let found: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM grants
            WHERE organization_id = $1 AND deleted_at IS NULL
              AND subject = ANY($2) AND privilege = $3 AND resource = $4
        )
        "#,
    )
    .bind(org_id)
    .bind(subjects)
    .bind(privilege)
    .bind(resource)
    .fetch_one(tx.conn())
    .await?;
    Ok(found)
}

#[derive(Debug, Clone, Copy)]
pub enum DeleteGrants {
    ById(Id),
    BySubject(Subject),
}

/// Soft delete. Each deleted row takes a fresh update index so watchers see
/// the removal.
#[instrument(skip(tx))]
pub async fn delete_grants(tx: &mut Transaction, by: DeleteGrants) -> Result<u64, AppError> {
    let org_id = tx.org_id()?;
    let (id, subject) = match by {
        DeleteGrants::ById(id) => (Some(id), None),
        DeleteGrants::BySubject(subject) => (None, Some(subject)),
    };

    let result = sqlx::query(
        r#"
        UPDATE grants
        SET deleted_at = $2, update_index = nextval('seq_update_index')
        WHERE organization_id = $1 AND deleted_at IS NULL
          AND ($3::bigint IS NULL OR id = $3)
          AND ($4::text IS NULL OR subject = $4)
        "#,
    )
    .bind(org_id)
    .bind(Utc::now())
    .bind(id)
    .bind(subject)
    .execute(tx.conn())
    .await?;
    Ok(result.rows_affected())
}

/// Add and remove grants in one step. Adds that already exist are skipped;
/// removes match on `(subject, privilege, resource)`.
#[instrument(skip(tx, add, remove), fields(add = add.len(), remove = remove.len()))]
pub async fn update_grants(
    tx: &mut Transaction,
    add: &mut [Grant],
    remove: &[Grant],
) -> Result<(), AppError> {
    for grant in add.iter_mut() {
        create_grant(tx, grant).await?;
    }

    let org_id = tx.org_id()?;
    for grant in remove {
        validate(grant)?;
        sqlx::query(
            r#"
            UPDATE grants
            SET deleted_at = $2, update_index = nextval('seq_update_index')
            WHERE organization_id = $1 AND deleted_at IS NULL
              AND subject = $3 AND privilege = $4 AND resource = $5
            "#,
        )
        .bind(org_id)
        .bind(Utc::now())
        .bind(grant.subject)
        .bind(&grant.privilege)
        .bind(&grant.resource)
        .execute(tx.conn())
        .await?;
    }
    Ok(())
}

/// Live grants holding `privilege` on `resource`.
pub async fn count_grants(
    tx: &mut Transaction,
    privilege: &str,
    resource: &str,
) -> Result<i64, AppError> {
    let org_id = tx.org_id()?;
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM grants
        WHERE organization_id = $1 AND deleted_at IS NULL AND privilege = $2 AND resource = $3
        "#,
    )
    .bind(org_id)
    .bind(privilege)
    .bind(resource)
    .fetch_one(tx.conn())
    .await?;
    Ok(count)
}
