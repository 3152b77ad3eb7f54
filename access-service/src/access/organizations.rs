use super::{authorize, RequestContext};
use crate::config::DefaultOrgConfig;
use crate::data;
use crate::db::{Database, TxOptions};
use crate::models::{Organization, SUPPORT_ADMIN_ROLE};
use chrono::Utc;
use service_core::api::CreateOrganizationRequest;
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::{info, instrument};

fn new_organization(name: &str, domain: &str, created_by: Id) -> Organization {
    let now = Utc::now();
    Organization {
        id: Id::generate(),
        created_at: now,
        updated_at: now,
        name: name.trim().to_string(),
        domain: domain.to_string(),
        created_by,
    }
}

/// Create a tenant with its built-in records. The organization is committed
/// in a transaction of its own, separate from the caller's organization.
#[instrument(skip(rctx, req), fields(name = %req.name))]
pub async fn create_organization(
    rctx: &mut RequestContext,
    req: &CreateOrganizationRequest,
) -> Result<Organization, AppError> {
    authorize(rctx, "create", "organization", &[SUPPORT_ADMIN_ROLE]).await?;

    let mut org = new_organization(&req.name, req.domain.as_deref().unwrap_or_default(), rctx.user()?.id);
    let mut tx = rctx.db.begin(TxOptions::read_write()).await?;
    data::organizations::create_organization(&mut tx, &mut org).await?;
    tx.commit().await?;
    Ok(org)
}

/// Find the organization for a request `Host`, ignoring any port.
pub async fn organization_for_host(db: &Database, host: &str) -> Result<Option<Organization>, AppError> {
    let domain = host.split(':').next().unwrap_or_default();
    if domain.is_empty() {
        return Ok(None);
    }
    let mut tx = db.begin(TxOptions::read_only()).await?;
    let org = data::organizations::get_organization_by_domain(&mut tx, domain).await?;
    tx.rollback().await?;
    Ok(org)
}

/// Load the configured default organization, creating it on first start.
#[instrument(skip(db, config), fields(name = %config.name))]
pub async fn ensure_default_organization(db: &Database, config: &DefaultOrgConfig) -> Result<Organization, AppError> {
    let mut tx = db.begin(TxOptions::read_write()).await?;
    if let Some(org) = data::organizations::get_organization_by_name(&mut tx, &config.name).await? {
        tx.rollback().await?;
        return Ok(org);
    }

    let mut org = new_organization(&config.name, &config.domain, Id::default());
    data::organizations::create_organization(&mut tx, &mut org).await?;
    tx.commit().await?;
    info!(org_id = %org.id, domain = %org.domain, "Created default organization");
    Ok(org)
}
