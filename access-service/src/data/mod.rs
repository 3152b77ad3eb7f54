//! Entity queries. Every function takes a [`Transaction`]; org-scoped
//! functions filter on the transaction's bound organization.

pub mod access_keys;
pub mod credentials;
pub mod destination_credentials;
pub mod destinations;
pub mod device_flow;
pub mod encryption_keys;
pub mod grants;
pub mod groups;
pub mod identities;
pub mod organizations;
pub mod providers;
pub mod settings;

use crate::crypto;
use crate::db::Transaction;
use service_core::error::AppError;

/// Seal a field with the database data key. Empty stays empty.
pub(crate) fn seal_field(tx: &Transaction, plain: &str) -> Result<String, AppError> {
    if plain.is_empty() {
        return Ok(String::new());
    }
    crypto::seal(tx.data_key()?, plain.as_bytes())
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("seal field: {}", e)))
}

pub(crate) fn unseal_field(tx: &Transaction, sealed: &str) -> Result<String, AppError> {
    if sealed.is_empty() {
        return Ok(String::new());
    }
    let plain = crypto::unseal(tx.data_key()?, sealed)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("unseal field: {}", e)))?;
    String::from_utf8(plain)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("unsealed field is not utf-8: {}", e)))
}
