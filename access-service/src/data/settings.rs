use crate::db::Transaction;
use crate::models::{PasswordRequirements, Settings};
use crate::services::jwt::generate_signing_jwk;
use service_core::api::Jwk;
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::instrument;

use super::{seal_field, unseal_field};

const SETTINGS_COLUMNS: &str = "id, organization_id, private_jwk, public_jwk, length_min, lowercase_min, \
     uppercase_min, number_min, symbol_min";

fn to_json(jwk: &Jwk) -> Result<String, AppError> {
    serde_json::to_string(jwk)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("encoding jwk: {}", e)))
}

fn from_json(raw: &str) -> Result<Jwk, AppError> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("decoding jwk: {}", e)))
}

/// Create the organization's settings row with a fresh signing key.
#[instrument(skip(tx))]
pub async fn create_settings(tx: &mut Transaction) -> Result<Settings, AppError> {
    let private = generate_signing_jwk();
    let settings = Settings {
        id: Id::generate(),
        organization_id: tx.org_id()?,
        private_jwk: to_json(&private)?,
        public_jwk: to_json(&private.public())?,
        password: PasswordRequirements::default(),
    };
    let sealed_private = seal_field(tx, &settings.private_jwk)?;

    sqlx::query(
        r#"
        INSERT INTO settings (id, organization_id, private_jwk, public_jwk, length_min, lowercase_min,
            uppercase_min, number_min, symbol_min)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(settings.id)
    .bind(settings.organization_id)
    .bind(sealed_private)
    .bind(&settings.public_jwk)
    .bind(settings.password.length_min)
    .bind(settings.password.lowercase_min)
    .bind(settings.password.uppercase_min)
    .bind(settings.password.number_min)
    .bind(settings.password.symbol_min)
    .execute(tx.conn())
    .await?;
    Ok(settings)
}

pub async fn get_settings(tx: &mut Transaction) -> Result<Settings, AppError> {
    let org_id = tx.org_id()?;
    let mut settings = sqlx::query_as::<_, Settings>(&format!(
        "SELECT {} FROM settings WHERE organization_id = $1 AND deleted_at IS NULL",
        SETTINGS_COLUMNS
    ))
    .bind(org_id)
    .fetch_optional(tx.conn())
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("settings not found")))?;
    settings.private_jwk = unseal_field(tx, &settings.private_jwk)?;
    Ok(settings)
}

impl Settings {
    pub fn signing_key(&self) -> Result<Jwk, AppError> {
        from_json(&self.private_jwk)
    }

    pub fn verification_key(&self) -> Result<Jwk, AppError> {
        from_json(&self.public_jwk)
    }
}
