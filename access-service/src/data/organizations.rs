use crate::crypto::random_from_alphabet;
use crate::db::Transaction;
use crate::models::{
    Grant, Identity, Organization, Provider, ProviderKind, CONNECTOR_IDENTITY_NAME, CONNECTOR_ROLE,
    INFRA_PROVIDER_NAME, INFRA_RESOURCE,
};
use chrono::Utc;
use service_core::error::AppError;
use service_core::subject::Subject;
use service_core::uid::Id;
use tracing::{info, instrument};

use super::{grants, identities, providers, settings};

const ORGANIZATION_COLUMNS: &str = "id, created_at, updated_at, name, domain, created_by";

const DOMAIN_SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const DOMAIN_SUFFIX_LEN: usize = 4;

/// Lower-case `domain` and check it is a DNS-safe name.
pub fn normalize_domain(domain: &str) -> Result<String, AppError> {
    let domain = domain.trim().to_ascii_lowercase();
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        });
    if !valid {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "invalid domain {:?}: must be a DNS-safe name",
            domain
        )));
    }
    Ok(domain)
}

/// A domain derived from the organization name plus a random suffix.
pub fn derive_domain(name: &str) -> String {
    let mut base: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    base = base.trim_matches('-').to_string();
    base.truncate(50);
    let base = base.trim_end_matches('-');
    let suffix = random_from_alphabet(DOMAIN_SUFFIX_LEN, DOMAIN_SUFFIX_ALPHABET);
    if base.is_empty() {
        suffix
    } else {
        format!("{}-{}", base, suffix)
    }
}

/// Create an organization together with the records every organization
/// needs: settings, the built-in provider, the connector identity and its
/// grant. Binds `tx` to the new organization.
#[instrument(skip(tx, org), fields(name = %org.name))]
pub async fn create_organization(tx: &mut Transaction, org: &mut Organization) -> Result<(), AppError> {
    if org.name.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("name is required")));
    }
    org.domain = if org.domain.is_empty() {
        derive_domain(&org.name)
    } else {
        normalize_domain(&org.domain)?
    };

    sqlx::query(
        r#"
        INSERT INTO organizations (id, created_at, updated_at, name, domain, created_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(org.id)
    .bind(org.created_at)
    .bind(org.updated_at)
    .bind(&org.name)
    .bind(&org.domain)
    .bind(org.created_by)
    .execute(tx.conn())
    .await?;

    tx.bind_org(org.id);
    settings::create_settings(tx).await?;

    let now = Utc::now();
    let mut infra = Provider {
        id: Id::generate(),
        organization_id: org.id,
        created_at: now,
        updated_at: now,
        name: INFRA_PROVIDER_NAME.to_string(),
        kind: ProviderKind::Infra.to_string(),
        url: String::new(),
        client_id: String::new(),
        client_secret: String::new(),
        auth_url: String::new(),
        scopes: Vec::new(),
        private_key: String::new(),
        client_email: String::new(),
        domain_admin_email: String::new(),
        created_by: Id::default(),
    };
    providers::create_provider(tx, &mut infra).await?;

    let mut connector = Identity::new(org.id, CONNECTOR_IDENTITY_NAME, Id::default());
    identities::create_identity(tx, &mut connector).await?;

    let mut grant = Grant::new(
        Subject::User(connector.id),
        CONNECTOR_ROLE,
        INFRA_RESOURCE,
        Id::default(),
    );
    grants::create_grant(tx, &mut grant).await?;

    info!(org_id = %org.id, domain = %org.domain, "Created organization");
    Ok(())
}

pub async fn get_organization(tx: &mut Transaction, id: Id) -> Result<Organization, AppError> {
    sqlx::query_as::<_, Organization>(&format!(
        "SELECT {} FROM organizations WHERE id = $1 AND deleted_at IS NULL",
        ORGANIZATION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(tx.conn())
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("organization not found")))
}

pub async fn get_organization_by_domain(
    tx: &mut Transaction,
    domain: &str,
) -> Result<Option<Organization>, AppError> {
    let org = sqlx::query_as::<_, Organization>(&format!(
        "SELECT {} FROM organizations WHERE domain = $1 AND deleted_at IS NULL",
        ORGANIZATION_COLUMNS
    ))
    .bind(domain.to_ascii_lowercase())
    .fetch_optional(tx.conn())
    .await?;
    Ok(org)
}

/// The oldest live organization with this name.
pub async fn get_organization_by_name(
    tx: &mut Transaction,
    name: &str,
) -> Result<Option<Organization>, AppError> {
    let org = sqlx::query_as::<_, Organization>(&format!(
        "SELECT {} FROM organizations WHERE name = $1 AND deleted_at IS NULL ORDER BY id ASC LIMIT 1",
        ORGANIZATION_COLUMNS
    ))
    .bind(name)
    .fetch_optional(tx.conn())
    .await?;
    Ok(org)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_are_lowercased_and_checked() {
        assert_eq!(normalize_domain("Acme.Example.COM").unwrap(), "acme.example.com");
        assert!(normalize_domain("bad domain").is_err());
        assert!(normalize_domain("-acme.com").is_err());
        assert!(normalize_domain("acme..com").is_err());
        assert!(normalize_domain("").is_err());
    }

    #[test]
    fn derived_domain_is_dns_safe_with_suffix() {
        let domain = derive_domain("Acme Corp!");
        assert!(domain.starts_with("acme-corp-"));
        assert_eq!(domain.len(), "acme-corp-".len() + DOMAIN_SUFFIX_LEN);
        assert!(normalize_domain(&domain).is_ok());
    }

    #[test]
    fn derived_domain_survives_symbol_only_names() {
        let domain = derive_domain("!!!");
        assert_eq!(domain.len(), DOMAIN_SUFFIX_LEN);
        assert!(normalize_domain(&domain).is_ok());
    }
}
