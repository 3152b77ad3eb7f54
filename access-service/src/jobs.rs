//! Periodic maintenance: hard-delete rows that can no longer be used.

use std::time::Duration;

use service_core::error::AppError;
use tokio_util::sync::CancellationToken;

use crate::data;
use crate::db::{Database, Transaction, TxOptions};
use crate::services::metrics::record_job_deletions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    RemoveExpiredAccessKeys,
    RemoveExpiredDestinationCredentials,
    RemoveExpiredPasswordResetTokens,
    DeleteExpiredDeviceFlowAuthRequests,
}

impl Job {
    pub const ALL: [Job; 4] = [
        Job::RemoveExpiredAccessKeys,
        Job::RemoveExpiredDestinationCredentials,
        Job::RemoveExpiredPasswordResetTokens,
        Job::DeleteExpiredDeviceFlowAuthRequests,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Job::RemoveExpiredAccessKeys => "remove_expired_access_keys",
            Job::RemoveExpiredDestinationCredentials => "remove_expired_destination_credentials",
            Job::RemoveExpiredPasswordResetTokens => "remove_expired_password_reset_tokens",
            Job::DeleteExpiredDeviceFlowAuthRequests => "delete_expired_device_flow_auth_requests",
        }
    }

    async fn execute(&self, tx: &mut Transaction) -> Result<u64, AppError> {
        match self {
            Job::RemoveExpiredAccessKeys => data::access_keys::remove_expired_access_keys(tx).await,
            Job::RemoveExpiredDestinationCredentials => {
                data::destination_credentials::remove_expired_destination_credentials(tx).await
            }
            Job::RemoveExpiredPasswordResetTokens => data::credentials::remove_expired_password_reset_tokens(tx).await,
            Job::DeleteExpiredDeviceFlowAuthRequests => data::device_flow::delete_expired(tx).await,
        }
    }

    /// Run in a transaction of its own.
    pub async fn run(&self, db: &Database) -> Result<u64, AppError> {
        let mut tx = db.begin(TxOptions::read_write()).await?;
        let deleted = self.execute(&mut tx).await?;
        tx.commit().await?;
        Ok(deleted)
    }
}

/// Run every job once. A failing job is logged and the rest still run.
pub async fn run_all(db: &Database) -> u64 {
    let mut total = 0;
    for job in Job::ALL {
        match job.run(db).await {
            Ok(deleted) => {
                record_job_deletions(job.name(), deleted);
                if deleted > 0 {
                    tracing::info!(job = job.name(), deleted, "Maintenance job removed rows");
                } else {
                    tracing::debug!(job = job.name(), "Maintenance job found nothing to remove");
                }
                total += deleted;
            }
            Err(e) => {
                tracing::error!(job = job.name(), error = %e, "Maintenance job failed");
            }
        }
    }
    total
}

/// Background task running [`run_all`] on a fixed interval until shut down.
pub struct MaintenanceWorker {
    db: Database,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl MaintenanceWorker {
    pub fn new(db: Database, interval: Duration) -> Self {
        Self {
            db,
            interval,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tracing::info!(interval_secs = self.interval.as_secs(), "Starting maintenance worker");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.shutdown_token.cancelled() => {
                        tracing::info!("Maintenance worker shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        run_all(&self.db).await;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        tracing::info!("Initiating maintenance worker shutdown");
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn job_names_are_unique_metric_labels() {
        let names: HashSet<_> = Job::ALL.iter().map(Job::name).collect();
        assert_eq!(names.len(), Job::ALL.len());
        assert!(names.iter().all(|n| n.chars().all(|c| c.is_ascii_lowercase() || c == '_')));
    }
}
