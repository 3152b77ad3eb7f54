//! Long-poll requests over LISTEN/NOTIFY.
//!
//! The listener subscribes before the first query so a change committed
//! between the query and the wait still wakes the request. Each query runs
//! in its own repeatable-read snapshot so the items and the update index it
//! returns agree.

use crate::db::{Channel, Database, Listener, Transaction, TxOptions};
use crate::services::metrics::record_blocking_request;
use service_core::axum::async_trait;
use service_core::error::AppError;
use service_core::uid::Id;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// One run of a long-poll query.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
    pub items: T,
    pub count: usize,
    pub update_index: i64,
}

#[async_trait]
pub trait BlockingQuery: Send {
    type Output: Send;

    async fn run(&mut self, tx: &mut Transaction) -> Result<QueryResult<Self::Output>, AppError>;

    /// Whether `result` is news to a client that last saw `last_index`.
    fn is_done(&self, result: &QueryResult<Self::Output>, last_index: i64) -> bool {
        result.count > 0 && result.update_index > last_index
    }
}

async fn run_snapshot<Q: BlockingQuery>(
    db: &Database,
    org_id: Id,
    query: &mut Q,
) -> Result<QueryResult<Q::Output>, AppError> {
    let mut tx = db.begin_for_org(org_id, TxOptions::snapshot()).await?;
    let result = query.run(&mut tx).await;
    tx.rollback().await?;
    result
}

async fn release(listener: Listener) {
    if let Err(e) = listener.release().await {
        warn!(error = %e, "Failed to release listener connection");
    }
}

/// Run `query`, then wait on `channels` until it has something newer than
/// `last_index` or `deadline` passes. A deadline with no change is
/// [`AppError::NotModified`]. After a notification the query runs once more
/// and its result is returned even when unchanged.
#[instrument(skip(db, query, channels))]
pub async fn run_blocking_request<Q: BlockingQuery>(
    db: &Database,
    org_id: Id,
    channels: &[Channel],
    last_index: i64,
    deadline: Instant,
    endpoint: &str,
    mut query: Q,
) -> Result<QueryResult<Q::Output>, AppError> {
    let mut listener = db.listen_for_notify(channels).await?;

    let first = match run_snapshot(db, org_id, &mut query).await {
        Ok(result) => result,
        Err(e) => {
            release(listener).await;
            return Err(e);
        }
    };
    if query.is_done(&first, last_index) {
        release(listener).await;
        record_blocking_request(endpoint, "changed");
        return Ok(first);
    }

    debug!(update_index = first.update_index, "Nothing new, waiting for notification");
    if let Err(e) = listener.wait_for_notification(deadline).await {
        release(listener).await;
        let outcome = if matches!(e, AppError::NotModified) { "not_modified" } else { "error" };
        record_blocking_request(endpoint, outcome);
        return Err(e);
    }
    release(listener).await;

    let result = run_snapshot(db, org_id, &mut query).await?;
    record_blocking_request(endpoint, "changed");
    Ok(result)
}
