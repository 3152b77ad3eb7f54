use crate::crypto::{SecretProvider, SymmetricKey};
use crate::models::EncryptionKey;
use service_core::error::AppError;
use service_core::uid::Id;
use sqlx::PgPool;
use tracing::{info, instrument};

/// Load the named data key, creating and storing one on first start.
///
/// Only the root-encrypted form is written; the plain key is returned for the
/// caller to keep in memory.
#[instrument(skip(pool, provider))]
pub async fn load_or_create_data_key(
    pool: &PgPool,
    provider: &dyn SecretProvider,
    name: &str,
    root_key_id: &str,
) -> Result<SymmetricKey, AppError> {
    let existing = sqlx::query_as::<_, EncryptionKey>(
        "SELECT id, name, encrypted, algorithm, root_key_id FROM encryption_keys WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    if let Some(stored) = existing {
        return provider
            .decrypt_data_key(&stored.root_key_id, &stored.encrypted)
            .await;
    }

    info!(name, root_key_id, "Creating database data key");
    let key = provider.generate_data_key(root_key_id).await?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO encryption_keys (id, name, encrypted, algorithm, root_key_id)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (name) DO NOTHING
        "#,
    )
    .bind(Id::generate())
    .bind(name)
    .bind(&key.encrypted)
    .bind(&key.algorithm)
    .bind(&key.root_key_id)
    .execute(pool)
    .await?
    .rows_affected();

    if inserted == 0 {
        // another replica won the race; use its key
        let stored = sqlx::query_as::<_, EncryptionKey>(
            "SELECT id, name, encrypted, algorithm, root_key_id FROM encryption_keys WHERE name = $1",
        )
        .bind(name)
        .fetch_one(pool)
        .await?;
        return provider
            .decrypt_data_key(&stored.root_key_id, &stored.encrypted)
            .await;
    }
    Ok(key)
}
