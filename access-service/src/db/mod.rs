//! PostgreSQL access: a query pool, a separate pool for LISTEN connections,
//! and organization-bound transactions.

pub mod listener;

pub use listener::{Channel, Listener};

use crate::config::DatabaseConfig;
use crate::crypto::SymmetricKey;
use crate::services::metrics::DB_QUERY_DURATION;
use service_core::error::AppError;
use service_core::uid::Id;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Postgres;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    #[default]
    ReadCommitted,
    /// One snapshot for the whole transaction.
    RepeatableRead,
}

impl Isolation {
    fn as_sql(self) -> &'static str {
        match self {
            Isolation::ReadCommitted => "READ COMMITTED",
            Isolation::RepeatableRead => "REPEATABLE READ",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Isolation,
    pub read_only: bool,
}

impl TxOptions {
    pub fn read_write() -> Self {
        Self::default()
    }

    pub fn read_only() -> Self {
        Self {
            isolation: Isolation::ReadCommitted,
            read_only: true,
        }
    }

    /// Read-only and consistent; what long-poll queries use.
    pub fn snapshot() -> Self {
        Self {
            isolation: Isolation::RepeatableRead,
            read_only: true,
        }
    }
}

/// Database connection pools.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    listener_pool: PgPool,
    data_key: Option<Arc<SymmetricKey>>,
}

impl Database {
    #[instrument(skip(config), fields(service = "access-service"))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        info!(
            max_connections = config.max_connections,
            listener_connections = config.listener_max_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        // LISTEN connections live as long as a long-poll, so they get their
        // own pool with no idle reaping.
        let listener_pool = PgPoolOptions::new()
            .max_connections(config.listener_max_connections)
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(None)
            .connect_lazy(&config.url)
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create listener pool: {}", e))
            })?;

        info!("PostgreSQL connection pools established");

        Ok(Self {
            pool,
            listener_pool,
            data_key: None,
        })
    }

    pub fn with_data_key(mut self, key: SymmetricKey) -> Self {
        self.data_key = Some(Arc::new(key));
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn listener_pool(&self) -> &PgPool {
        &self.listener_pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Start a transaction that is not yet bound to an organization.
    pub async fn begin(&self, opts: TxOptions) -> Result<Transaction, AppError> {
        let mut inner = self.pool.begin().await?;
        let mode = if opts.read_only { " READ ONLY" } else { "" };
        let stmt = format!(
            "SET TRANSACTION ISOLATION LEVEL {}{}",
            opts.isolation.as_sql(),
            mode
        );
        sqlx::query(&stmt).execute(&mut *inner).await?;

        Ok(Transaction {
            inner,
            org_id: None,
            data_key: self.data_key.clone(),
        })
    }

    /// Start a transaction bound to `org_id`.
    pub async fn begin_for_org(&self, org_id: Id, opts: TxOptions) -> Result<Transaction, AppError> {
        let mut tx = self.begin(opts).await?;
        tx.bind_org(org_id);
        Ok(tx)
    }
}

/// A transaction, optionally pinned to an organization. Dropping it without
/// calling [`Transaction::commit`] rolls back.
pub struct Transaction {
    inner: sqlx::Transaction<'static, Postgres>,
    org_id: Option<Id>,
    data_key: Option<Arc<SymmetricKey>>,
}

impl Transaction {
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.inner
    }

    pub fn bind_org(&mut self, org_id: Id) {
        self.org_id = Some(org_id);
    }

    /// The bound organization. Entity queries fail without one.
    pub fn org_id(&self) -> Result<Id, AppError> {
        self.org_id.ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("transaction is not bound to an organization"))
        })
    }

    pub fn data_key(&self) -> Result<&SymmetricKey, AppError> {
        self.data_key
            .as_deref()
            .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("database data key not loaded")))
    }

    pub async fn commit(self) -> Result<(), AppError> {
        self.inner.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), AppError> {
        self.inner.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_repeatable_read_only() {
        let opts = TxOptions::snapshot();
        assert_eq!(opts.isolation, Isolation::RepeatableRead);
        assert!(opts.read_only);
        assert_eq!(TxOptions::read_write().isolation.as_sql(), "READ COMMITTED");
    }
}
