use crate::db::Transaction;
use crate::models::Group;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::Utc;
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::{debug, instrument};

const GROUP_COLUMNS: &str =
    "g.id, g.organization_id, g.created_at, g.updated_at, g.name, g.created_by, g.created_by_provider";

#[derive(Debug, Clone, Default)]
pub struct ListGroupsOptions {
    pub by_name: Option<String>,
    /// Only groups this identity belongs to.
    pub by_member: Option<Id>,
    pub by_ids: Vec<Id>,
}

#[instrument(skip(tx, group), fields(name = %group.name))]
pub async fn create_group(tx: &mut Transaction, group: &mut Group) -> Result<(), AppError> {
    if group.name.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("group name is required")));
    }
    group.organization_id = tx.org_id()?;
    sqlx::query(
        r#"
        INSERT INTO groups (id, organization_id, created_at, updated_at, name, created_by, created_by_provider)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(group.id)
    .bind(group.organization_id)
    .bind(group.created_at)
    .bind(group.updated_at)
    .bind(&group.name)
    .bind(group.created_by)
    .bind(group.created_by_provider)
    .execute(tx.conn())
    .await?;
    Ok(())
}

pub async fn get_group(tx: &mut Transaction, id: Id) -> Result<Group, AppError> {
    let mut groups = list_groups(
        tx,
        &ListGroupsOptions {
            by_ids: vec![id],
            ..Default::default()
        },
    )
    .await?;
    groups
        .pop()
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("group not found")))
}

pub async fn get_group_by_name(tx: &mut Transaction, name: &str) -> Result<Group, AppError> {
    let mut groups = list_groups(
        tx,
        &ListGroupsOptions {
            by_name: Some(name.to_string()),
            ..Default::default()
        },
    )
    .await?;
    groups
        .pop()
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("group not found")))
}

/// Groups with their member counts, ordered by name.
#[instrument(skip(tx))]
pub async fn list_groups(
    tx: &mut Transaction,
    opts: &ListGroupsOptions,
) -> Result<Vec<Group>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["list_groups"])
        .start_timer();
    let org_id = tx.org_id()?;
    let ids: Option<Vec<Id>> = (!opts.by_ids.is_empty()).then(|| opts.by_ids.clone());

    let groups = sqlx::query_as::<_, Group>(&format!(
        r#"
        SELECT {},
            (SELECT COUNT(*) FROM identities_groups ig WHERE ig.group_id = g.id) AS total_users
        FROM groups g
        WHERE g.organization_id = $1 AND g.deleted_at IS NULL
          AND ($2::text IS NULL OR g.name = $2)
          AND ($3::bigint IS NULL OR EXISTS (
                SELECT 1 FROM identities_groups m WHERE m.group_id = g.id AND m.identity_id = $3))
          AND ($4::bigint[] IS NULL OR g.id = ANY($4))
        ORDER BY g.name ASC
        "#,
        GROUP_COLUMNS
    ))
    .bind(org_id)
    .bind(opts.by_name.as_deref())
    .bind(opts.by_member)
    .bind(ids)
    .fetch_all(tx.conn())
    .await?;

    timer.observe_duration();
    Ok(groups)
}

pub async fn group_ids_for_identity(
    tx: &mut Transaction,
    identity_id: Id,
) -> Result<Vec<Id>, AppError> {
    let ids = sqlx::query_scalar::<_, Id>(
        "SELECT DISTINCT group_id FROM identities_groups WHERE identity_id = $1",
    )
    .bind(identity_id)
    .fetch_all(tx.conn())
    .await?;
    Ok(ids)
}

/// Soft delete the group and drop its memberships. Grants are the caller's
/// concern.
#[instrument(skip(tx))]
pub async fn delete_group(tx: &mut Transaction, id: Id) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    sqlx::query("DELETE FROM identities_groups WHERE group_id = $1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    sqlx::query(
        "UPDATE groups SET deleted_at = $3 WHERE organization_id = $1 AND id = $2 AND deleted_at IS NULL",
    )
    .bind(org_id)
    .bind(id)
    .bind(Utc::now())
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Admin-managed memberships. Adding an existing member is a no-op.
#[instrument(skip(tx, identity_ids), fields(count = identity_ids.len()))]
pub async fn add_users_to_group(
    tx: &mut Transaction,
    group_id: Id,
    identity_ids: &[Id],
) -> Result<(), AppError> {
    if identity_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        INSERT INTO identities_groups (group_id, identity_id)
        SELECT $1, unnest($2::bigint[])
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(group_id)
    .bind(identity_ids)
    .execute(tx.conn())
    .await?;
    Ok(())
}

#[instrument(skip(tx, identity_ids), fields(count = identity_ids.len()))]
pub async fn remove_users_from_group(
    tx: &mut Transaction,
    group_id: Id,
    identity_ids: &[Id],
) -> Result<(), AppError> {
    if identity_ids.is_empty() {
        return Ok(());
    }
    sqlx::query("DELETE FROM identities_groups WHERE group_id = $1 AND identity_id = ANY($2)")
        .bind(group_id)
        .bind(identity_ids)
        .execute(tx.conn())
        .await?;
    Ok(())
}

/// Drop every membership of one identity.
pub async fn remove_identity_from_all_groups(
    tx: &mut Transaction,
    identity_id: Id,
) -> Result<(), AppError> {
    sqlx::query("DELETE FROM identities_groups WHERE identity_id = $1")
        .bind(identity_id)
        .execute(tx.conn())
        .await?;
    Ok(())
}

/// Make the provider-sourced memberships of `identity_id` match `group_names`.
///
/// Memberships added by an admin (`provider_id = 0`) are left alone. Groups
/// named by the provider that do not exist yet are created.
#[instrument(skip(tx, group_names), fields(groups = group_names.len()))]
pub async fn sync_provider_groups(
    tx: &mut Transaction,
    provider_id: Id,
    identity_id: Id,
    group_names: &[String],
) -> Result<(), AppError> {
    let org_id = tx.org_id()?;

    for name in group_names {
        sqlx::query(
            r#"
            INSERT INTO provider_groups (organization_id, provider_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(org_id)
        .bind(provider_id)
        .bind(name)
        .execute(tx.conn())
        .await?;

        sqlx::query(
            r#"
            INSERT INTO provider_groups_provider_users (provider_id, provider_group_name, provider_user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(provider_id)
        .bind(name)
        .bind(identity_id)
        .execute(tx.conn())
        .await?;
    }

    sqlx::query(
        r#"
        DELETE FROM provider_groups_provider_users
        WHERE provider_id = $1 AND provider_user_id = $2 AND NOT (provider_group_name = ANY($3))
        "#,
    )
    .bind(provider_id)
    .bind(identity_id)
    .bind(group_names)
    .execute(tx.conn())
    .await?;

    let removed = sqlx::query(
        r#"
        DELETE FROM identities_groups
        WHERE identity_id = $1 AND provider_id = $2 AND NOT (provider_group_name = ANY($3))
        "#,
    )
    .bind(identity_id)
    .bind(provider_id)
    .bind(group_names)
    .execute(tx.conn())
    .await?
    .rows_affected();

    for name in group_names {
        let group_id = match get_group_by_name(tx, name).await {
            Ok(group) => group.id,
            Err(e) if e.is_not_found() => {
                let mut group = Group::new(org_id, name.clone(), Id::default());
                group.created_by_provider = provider_id;
                create_group(tx, &mut group).await?;
                group.id
            }
            Err(e) => return Err(e),
        };

        sqlx::query(
            r#"
            INSERT INTO identities_groups (group_id, identity_id, provider_id, provider_group_name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(group_id)
        .bind(identity_id)
        .bind(provider_id)
        .bind(name)
        .execute(tx.conn())
        .await?;
    }

    debug!(removed, "Provider group memberships synced");
    Ok(())
}
