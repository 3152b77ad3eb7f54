//! LISTEN/NOTIFY subscriptions for long-poll requests.
//!
//! Channel names are `<type>.<org>.<entity>` with base58 IDs. Triggers in the
//! schema send to the same names, and Postgres delivers a notification only
//! when the sending transaction commits.

use super::Database;
use service_core::error::AppError;
use service_core::uid::Id;
use sqlx::postgres::PgListener;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// How long a release may take after the request that used the listener is gone.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Any grant on the destination or one of its sub-resources changed.
    GrantsByDestination { org_id: Id, destination_id: Id },
    /// A user asked the destination for a credential.
    DestinationCredentialRequest { org_id: Id, destination_id: Id },
    /// A connector answered one credential request.
    DestinationCredentialResponse { org_id: Id, credential_id: Id },
    /// Membership of a group changed.
    GroupMembers { org_id: Id, group_id: Id },
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::GrantsByDestination {
                org_id,
                destination_id,
            } => write!(f, "grantsByDest.{}.{}", org_id, destination_id),
            Channel::DestinationCredentialRequest {
                org_id,
                destination_id,
            } => write!(f, "destCredReq.{}.{}", org_id, destination_id),
            Channel::DestinationCredentialResponse {
                org_id,
                credential_id,
            } => write!(f, "destCredResp.{}.{}", org_id, credential_id),
            Channel::GroupMembers { org_id, group_id } => {
                write!(f, "groupMembers.{}.{}", org_id, group_id)
            }
        }
    }
}

/// A connection from the listener pool subscribed to some channels. It is
/// never used for anything but LISTEN.
pub struct Listener {
    inner: Option<PgListener>,
}

impl Database {
    /// Subscribe to `channels`. Call this before running the query whose
    /// result the notification would invalidate.
    #[instrument(skip(self, channels), fields(channels = channels.len()))]
    pub async fn listen_for_notify(&self, channels: &[Channel]) -> Result<Listener, AppError> {
        let mut listener = PgListener::connect_with(self.listener_pool()).await?;
        for channel in channels {
            // listen_on_chan quotes the name, which has dots in it
            sqlx::query("SELECT listen_on_chan($1)")
                .bind(channel.to_string())
                .execute(&mut listener)
                .await?;
        }
        debug!(channels = ?channels.iter().map(ToString::to_string).collect::<Vec<_>>(), "Listening");
        Ok(Listener {
            inner: Some(listener),
        })
    }
}

impl Listener {
    /// Block until any subscribed channel fires. Reaching `deadline` returns
    /// [`AppError::NotModified`].
    pub async fn wait_for_notification(&mut self, deadline: Instant) -> Result<(), AppError> {
        let listener = self
            .inner
            .as_mut()
            .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("listener already released")))?;

        match tokio::time::timeout_at(deadline, listener.try_recv()).await {
            Err(_) => Err(AppError::NotModified),
            Ok(Ok(Some(notification))) => {
                debug!(channel = notification.channel(), "Notified");
                Ok(())
            }
            // the connection dropped and anything sent meanwhile is lost
            Ok(Ok(None)) => Err(AppError::DatabaseError(anyhow::anyhow!(
                "listener connection lost"
            ))),
            Ok(Err(e)) => Err(AppError::DatabaseError(anyhow::anyhow!(
                "waiting for notify: {}",
                e
            ))),
        }
    }

    /// Unlisten everything and return the connection to its pool.
    pub async fn release(mut self) -> Result<(), AppError> {
        match self.inner.take() {
            Some(listener) => release(listener).await,
            None => Ok(()),
        }
    }
}

async fn release(mut listener: PgListener) -> Result<(), AppError> {
    match tokio::time::timeout(RELEASE_TIMEOUT, listener.unlisten_all()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AppError::DatabaseError(anyhow::anyhow!(
            "release listener: {}",
            e
        ))),
        Err(_) => Err(AppError::Timeout("release listener".to_string())),
    }
}

impl Drop for Listener {
    // A request dropped mid-wait still gets its connection back, on a
    // deadline of its own.
    fn drop(&mut self) {
        if let Some(listener) = self.inner.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = release(listener).await {
                        warn!(error = %e, "Failed to release listener connection");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_use_base58_ids() {
        let org_id = Id::from_i64(58);
        let channel = Channel::GrantsByDestination {
            org_id,
            destination_id: Id::from_i64(1),
        };
        assert_eq!(channel.to_string(), "grantsByDest.21.2");

        let channel = Channel::DestinationCredentialResponse {
            org_id,
            credential_id: Id::from_i64(57),
        };
        assert_eq!(channel.to_string(), "destCredResp.21.Z");
    }

    #[test]
    fn channel_names_fit_in_an_identifier() {
        let max = Id::from_i64(i64::MAX);
        let channel = Channel::DestinationCredentialRequest {
            org_id: max,
            destination_id: max,
        };
        // Postgres truncates identifiers past 63 bytes
        assert!(channel.to_string().len() <= 63);
    }
}
