use crate::db::Transaction;
use crate::models::{Provider, ProviderKind, ProviderUser, INFRA_PROVIDER_NAME};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::Utc;
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::instrument;

use super::{seal_field, unseal_field};

const PROVIDER_COLUMNS: &str = "id, organization_id, created_at, updated_at, name, kind, url, client_id, \
     client_secret, auth_url, scopes, private_key, client_email, domain_admin_email, created_by";

const PROVIDER_USER_COLUMNS: &str = "identity_id, provider_id, organization_id, email, groups, last_update, \
     redirect_url, access_token, refresh_token, expires_at, active";

#[derive(Debug, Clone, Default)]
pub struct ListProvidersOptions {
    pub by_name: Option<String>,
    pub by_ids: Vec<Id>,
    pub exclude_infra: bool,
}

fn open_provider(tx: &Transaction, mut provider: Provider) -> Result<Provider, AppError> {
    provider.client_secret = unseal_field(tx, &provider.client_secret)?;
    provider.private_key = unseal_field(tx, &provider.private_key)?;
    Ok(provider)
}

fn open_provider_user(tx: &Transaction, mut user: ProviderUser) -> Result<ProviderUser, AppError> {
    user.access_token = unseal_field(tx, &user.access_token)?;
    user.refresh_token = unseal_field(tx, &user.refresh_token)?;
    Ok(user)
}

#[instrument(skip(tx, provider), fields(name = %provider.name, kind = %provider.kind))]
pub async fn create_provider(tx: &mut Transaction, provider: &mut Provider) -> Result<(), AppError> {
    if provider.name.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("name is required")));
    }
    provider
        .kind
        .parse::<ProviderKind>()
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;
    provider.organization_id = tx.org_id()?;

    let client_secret = seal_field(tx, &provider.client_secret)?;
    let private_key = seal_field(tx, &provider.private_key)?;
    sqlx::query(
        r#"
        INSERT INTO providers (id, organization_id, created_at, updated_at, name, kind, url, client_id,
            client_secret, auth_url, scopes, private_key, client_email, domain_admin_email, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(provider.id)
    .bind(provider.organization_id)
    .bind(provider.created_at)
    .bind(provider.updated_at)
    .bind(&provider.name)
    .bind(&provider.kind)
    .bind(&provider.url)
    .bind(&provider.client_id)
    .bind(client_secret)
    .bind(&provider.auth_url)
    .bind(&provider.scopes)
    .bind(private_key)
    .bind(&provider.client_email)
    .bind(&provider.domain_admin_email)
    .bind(provider.created_by)
    .execute(tx.conn())
    .await?;
    Ok(())
}

pub async fn get_provider(tx: &mut Transaction, id: Id) -> Result<Provider, AppError> {
    let org_id = tx.org_id()?;
    let provider = sqlx::query_as::<_, Provider>(&format!(
        "SELECT {} FROM providers WHERE organization_id = $1 AND id = $2 AND deleted_at IS NULL",
        PROVIDER_COLUMNS
    ))
    .bind(org_id)
    .bind(id)
    .fetch_optional(tx.conn())
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("provider not found")))?;
    open_provider(tx, provider)
}

/// The organization's built-in provider.
pub async fn get_infra_provider(tx: &mut Transaction) -> Result<Provider, AppError> {
    let org_id = tx.org_id()?;
    let provider = sqlx::query_as::<_, Provider>(&format!(
        "SELECT {} FROM providers WHERE organization_id = $1 AND kind = $2 AND deleted_at IS NULL",
        PROVIDER_COLUMNS
    ))
    .bind(org_id)
    .bind(ProviderKind::Infra.as_str())
    .fetch_optional(tx.conn())
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("infra provider not found")))?;
    open_provider(tx, provider)
}

#[instrument(skip(tx))]
pub async fn list_providers(
    tx: &mut Transaction,
    opts: &ListProvidersOptions,
) -> Result<Vec<Provider>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["list_providers"])
        .start_timer();
    let org_id = tx.org_id()?;
    let ids: Option<Vec<Id>> = (!opts.by_ids.is_empty()).then(|| opts.by_ids.clone());

    let rows = sqlx::query_as::<_, Provider>(&format!(
        r#"
        SELECT {} FROM providers
        WHERE organization_id = $1 AND deleted_at IS NULL
          AND ($2::text IS NULL OR name = $2)
          AND ($3::bigint[] IS NULL OR id = ANY($3))
          AND (NOT $4 OR kind <> $5)
        ORDER BY name ASC
        "#,
        PROVIDER_COLUMNS
    ))
    .bind(org_id)
    .bind(opts.by_name.as_deref())
    .bind(ids)
    .bind(opts.exclude_infra)
    .bind(ProviderKind::Infra.as_str())
    .fetch_all(tx.conn())
    .await?;

    timer.observe_duration();
    rows.into_iter().map(|p| open_provider(tx, p)).collect()
}

#[instrument(skip(tx, provider), fields(id = %provider.id))]
pub async fn update_provider(tx: &mut Transaction, provider: &mut Provider) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    provider.updated_at = Utc::now();
    let client_secret = seal_field(tx, &provider.client_secret)?;
    let private_key = seal_field(tx, &provider.private_key)?;
    let result = sqlx::query(
        r#"
        UPDATE providers SET updated_at = $3, name = $4, kind = $5, url = $6, client_id = $7,
            client_secret = $8, auth_url = $9, scopes = $10, private_key = $11, client_email = $12,
            domain_admin_email = $13
        WHERE organization_id = $1 AND id = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(org_id)
    .bind(provider.id)
    .bind(provider.updated_at)
    .bind(&provider.name)
    .bind(&provider.kind)
    .bind(&provider.url)
    .bind(&provider.client_id)
    .bind(client_secret)
    .bind(&provider.auth_url)
    .bind(&provider.scopes)
    .bind(private_key)
    .bind(&provider.client_email)
    .bind(&provider.domain_admin_email)
    .execute(tx.conn())
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(anyhow::anyhow!("provider not found")));
    }
    Ok(())
}

/// Delete a provider, its provider users, and identities left with no
/// provider at all. The built-in provider cannot be deleted.
#[instrument(skip(tx))]
pub async fn delete_provider(tx: &mut Transaction, id: Id) -> Result<(), AppError> {
    let provider = match get_provider(tx, id).await {
        Ok(provider) => provider,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    if provider.kind() == ProviderKind::Infra || provider.name == INFRA_PROVIDER_NAME {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "the infra provider can not be deleted"
        )));
    }

    let orphaned: Vec<Id> = sqlx::query_scalar(
        r#"
        SELECT pu.identity_id FROM provider_users pu
        WHERE pu.provider_id = $1
          AND NOT EXISTS (
              SELECT 1 FROM provider_users other
              WHERE other.identity_id = pu.identity_id AND other.provider_id <> $1)
          AND NOT EXISTS (
              SELECT 1 FROM credentials c WHERE c.identity_id = pu.identity_id AND c.deleted_at IS NULL)
        "#,
    )
    .bind(id)
    .fetch_all(tx.conn())
    .await?;

    sqlx::query("DELETE FROM provider_users WHERE provider_id = $1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    sqlx::query("DELETE FROM identities_groups WHERE provider_id = $1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    sqlx::query("DELETE FROM provider_groups_provider_users WHERE provider_id = $1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    sqlx::query("DELETE FROM provider_groups WHERE provider_id = $1")
        .bind(id)
        .execute(tx.conn())
        .await?;

    super::identities::delete_identities(tx, &orphaned).await?;

    let org_id = tx.org_id()?;
    sqlx::query("UPDATE providers SET deleted_at = $3 WHERE organization_id = $1 AND id = $2")
        .bind(org_id)
        .bind(id)
        .bind(Utc::now())
        .execute(tx.conn())
        .await?;
    Ok(())
}

#[instrument(skip(tx, user), fields(identity_id = %user.identity_id, provider_id = %user.provider_id))]
pub async fn create_provider_user(tx: &mut Transaction, user: &mut ProviderUser) -> Result<(), AppError> {
    user.organization_id = tx.org_id()?;
    user.last_update = Utc::now();
    let access_token = seal_field(tx, &user.access_token)?;
    let refresh_token = seal_field(tx, &user.refresh_token)?;
    sqlx::query(
        r#"
        INSERT INTO provider_users (identity_id, provider_id, organization_id, email, groups, last_update,
            redirect_url, access_token, refresh_token, expires_at, active)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(user.identity_id)
    .bind(user.provider_id)
    .bind(user.organization_id)
    .bind(&user.email)
    .bind(&user.groups)
    .bind(user.last_update)
    .bind(&user.redirect_url)
    .bind(access_token)
    .bind(refresh_token)
    .bind(user.expires_at)
    .bind(user.active)
    .execute(tx.conn())
    .await?;
    Ok(())
}

pub async fn get_provider_user(
    tx: &mut Transaction,
    provider_id: Id,
    identity_id: Id,
) -> Result<ProviderUser, AppError> {
    let org_id = tx.org_id()?;
    let user = sqlx::query_as::<_, ProviderUser>(&format!(
        "SELECT {} FROM provider_users WHERE organization_id = $1 AND provider_id = $2 AND identity_id = $3",
        PROVIDER_USER_COLUMNS
    ))
    .bind(org_id)
    .bind(provider_id)
    .bind(identity_id)
    .fetch_optional(tx.conn())
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("provider user not found")))?;
    open_provider_user(tx, user)
}

#[instrument(skip(tx, user), fields(identity_id = %user.identity_id, provider_id = %user.provider_id))]
pub async fn update_provider_user(tx: &mut Transaction, user: &mut ProviderUser) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    user.last_update = Utc::now();
    let access_token = seal_field(tx, &user.access_token)?;
    let refresh_token = seal_field(tx, &user.refresh_token)?;
    sqlx::query(
        r#"
        UPDATE provider_users SET email = $4, groups = $5, last_update = $6, redirect_url = $7,
            access_token = $8, refresh_token = $9, expires_at = $10, active = $11
        WHERE organization_id = $1 AND provider_id = $2 AND identity_id = $3
        "#,
    )
    .bind(org_id)
    .bind(user.provider_id)
    .bind(user.identity_id)
    .bind(&user.email)
    .bind(&user.groups)
    .bind(user.last_update)
    .bind(&user.redirect_url)
    .bind(access_token)
    .bind(refresh_token)
    .bind(user.expires_at)
    .bind(user.active)
    .execute(tx.conn())
    .await?;
    Ok(())
}

pub async fn delete_provider_user(
    tx: &mut Transaction,
    provider_id: Id,
    identity_id: Id,
) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    sqlx::query("DELETE FROM provider_users WHERE organization_id = $1 AND provider_id = $2 AND identity_id = $3")
        .bind(org_id)
        .bind(provider_id)
        .bind(identity_id)
        .execute(tx.conn())
        .await?;
    Ok(())
}

pub async fn delete_provider_users_for_identity(
    tx: &mut Transaction,
    identity_id: Id,
) -> Result<(), AppError> {
    let org_id = tx.org_id()?;
    sqlx::query("DELETE FROM provider_users WHERE organization_id = $1 AND identity_id = $2")
        .bind(org_id)
        .bind(identity_id)
        .execute(tx.conn())
        .await?;
    sqlx::query("DELETE FROM provider_groups_provider_users WHERE provider_user_id = $1")
        .bind(identity_id)
        .execute(tx.conn())
        .await?;
    Ok(())
}

/// Names of the providers an identity is known in, built-in included.
pub async fn provider_names_for_identity(
    tx: &mut Transaction,
    identity_id: Id,
) -> Result<Vec<String>, AppError> {
    let org_id = tx.org_id()?;
    let names = sqlx::query_scalar::<_, String>(
        r#"
        SELECT p.name FROM providers p
        JOIN provider_users pu ON pu.provider_id = p.id
        WHERE p.organization_id = $1 AND pu.identity_id = $2 AND p.deleted_at IS NULL
        ORDER BY p.name ASC
        "#,
    )
    .bind(org_id)
    .bind(identity_id)
    .fetch_all(tx.conn())
    .await?;
    Ok(names)
}
