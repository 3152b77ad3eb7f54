use crate::db::Transaction;
use crate::models::Destination;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::instrument;

const DESTINATION_COLUMNS: &str = "id, organization_id, created_at, updated_at, name, unique_id, kind, \
     connection_url, connection_ca, last_seen_at, version, resources, roles";

/// Minimum gap between two heartbeat writes for one destination.
const LAST_SEEN_THROTTLE_MINUTES: i64 = 2;

#[derive(Debug, Clone, Default)]
pub struct ListDestinationsOptions {
    pub by_name: Option<String>,
    pub by_kind: Option<String>,
    pub by_unique_id: Option<String>,
}

fn validate(destination: &Destination) -> Result<(), AppError> {
    if destination.name.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("name is required")));
    }
    if destination.name.contains('.') {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "destination name must not contain '.'"
        )));
    }
    if destination.unique_id.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("uniqueID is required")));
    }
    Ok(())
}

#[instrument(skip(tx, destination), fields(name = %destination.name))]
pub async fn create_destination(tx: &mut Transaction, destination: &mut Destination) -> Result<(), AppError> {
    validate(destination)?;
    destination.organization_id = tx.org_id()?;
    sqlx::query(
        r#"
        INSERT INTO destinations (id, organization_id, created_at, updated_at, name, unique_id, kind,
            connection_url, connection_ca, last_seen_at, version, resources, roles)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(destination.id)
    .bind(destination.organization_id)
    .bind(destination.created_at)
    .bind(destination.updated_at)
    .bind(&destination.name)
    .bind(&destination.unique_id)
    .bind(&destination.kind)
    .bind(&destination.connection_url)
    .bind(&destination.connection_ca)
    .bind(destination.last_seen_at)
    .bind(&destination.version)
    .bind(&destination.resources)
    .bind(&destination.roles)
    .execute(tx.conn())
    .await?;
    Ok(())
}

#[instrument(skip(tx, destination), fields(id = %destination.id))]
pub async fn update_destination(tx: &mut Transaction, destination: &mut Destination) -> Result<(), AppError> {
    validate(destination)?;
    let org_id = tx.org_id()?;
    destination.updated_at = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE destinations SET updated_at = $3, name = $4, unique_id = $5, kind = $6, connection_url = $7,
            connection_ca = $8, version = $9, resources = $10, roles = $11
        WHERE organization_id = $1 AND id = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(org_id)
    .bind(destination.id)
    .bind(destination.updated_at)
    .bind(&destination.name)
    .bind(&destination.unique_id)
    .bind(&destination.kind)
    .bind(&destination.connection_url)
    .bind(&destination.connection_ca)
    .bind(&destination.version)
    .bind(&destination.resources)
    .bind(&destination.roles)
    .execute(tx.conn())
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(anyhow::anyhow!("destination not found")));
    }
    Ok(())
}

pub async fn get_destination(tx: &mut Transaction, id: Id) -> Result<Destination, AppError> {
    let org_id = tx.org_id()?;
    sqlx::query_as::<_, Destination>(&format!(
        "SELECT {} FROM destinations WHERE organization_id = $1 AND id = $2 AND deleted_at IS NULL",
        DESTINATION_COLUMNS
    ))
    .bind(org_id)
    .bind(id)
    .fetch_optional(tx.conn())
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("destination not found")))
}

pub async fn get_destination_by_name(tx: &mut Transaction, name: &str) -> Result<Destination, AppError> {
    let mut found = list_destinations(
        tx,
        &ListDestinationsOptions {
            by_name: Some(name.to_string()),
            ..Default::default()
        },
    )
    .await?;
    found
        .pop()
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("destination not found")))
}

pub async fn get_destination_by_unique_id(
    tx: &mut Transaction,
    unique_id: &str,
) -> Result<Option<Destination>, AppError> {
    let mut found = list_destinations(
        tx,
        &ListDestinationsOptions {
            by_unique_id: Some(unique_id.to_string()),
            ..Default::default()
        },
    )
    .await?;
    Ok(found.pop())
}

#[instrument(skip(tx))]
pub async fn list_destinations(
    tx: &mut Transaction,
    opts: &ListDestinationsOptions,
) -> Result<Vec<Destination>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["list_destinations"])
        .start_timer();
    let org_id = tx.org_id()?;
    let destinations = sqlx::query_as::<_, Destination>(&format!(
        r#"
        SELECT {} FROM destinations
        WHERE organization_id = $1 AND deleted_at IS NULL
          AND ($2::text IS NULL OR name = $2)
          AND ($3::text IS NULL OR kind = $3)
          AND ($4::text IS NULL OR unique_id = $4)
        ORDER BY name ASC
        "#,
        DESTINATION_COLUMNS
    ))
    .bind(org_id)
    .bind(opts.by_name.as_deref())
    .bind(opts.by_kind.as_deref())
    .bind(opts.by_unique_id.as_deref())
    .fetch_all(tx.conn())
    .await?;
    timer.observe_duration();
    Ok(destinations)
}

#[instrument(skip(tx))]
pub async fn delete_destination(tx: &mut Transaction, id: Id) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    sqlx::query(
        "UPDATE destinations SET deleted_at = $3 WHERE organization_id = $1 AND id = $2 AND deleted_at IS NULL",
    )
    .bind(org_id)
    .bind(id)
    .bind(Utc::now())
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Record a connector heartbeat. Writes only when the version changed or the
/// last write is older than the throttle window.
pub async fn touch_destination(
    tx: &mut Transaction,
    destination: &mut Destination,
    version: &str,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let fresh = destination
        .last_seen_at
        .map(|seen| now - seen < Duration::minutes(LAST_SEEN_THROTTLE_MINUTES))
        .unwrap_or(false);
    if fresh && destination.version == version {
        return Ok(());
    }
    sqlx::query(
        "UPDATE destinations SET last_seen_at = $3, version = $4 WHERE organization_id = $1 AND id = $2",
    )
    .bind(destination.organization_id)
    .bind(destination.id)
    .bind(now)
    .bind(version)
    .execute(tx.conn())
    .await?;
    destination.last_seen_at = Some(now);
    destination.version = version.to_string();
    Ok(())
}
