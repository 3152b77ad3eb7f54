//! Just-in-time destination credentials.
//!
//! A user's request is a row; the connector for the destination long-polls
//! for open rows, mints a credential and writes it back; the user's request
//! wakes on the answer. The database carries both hand-offs.

use super::blocking::{run_blocking_request, BlockingQuery, QueryResult};
use super::{authorize, RequestContext};
use crate::data;
use crate::data::grants::ListGrantsOptions;
use crate::db::{Channel, Transaction};
use crate::error::ServiceError;
use crate::models::{DestinationCredential, ADMIN_ROLE, CONNECTOR_ROLE};
use crate::services::metrics::DESTINATION_CREDENTIAL_DURATION;
use chrono::{DateTime, Utc};
use service_core::api::{self, AnswerDestinationCredentialRequest, ListDestinationCredentialsQuery, ListResponse};
use service_core::axum::async_trait;
use service_core::error::AppError;
use service_core::subject::Subject;
use service_core::uid::Id;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

struct Answer {
    id: Id,
}

#[async_trait]
impl BlockingQuery for Answer {
    type Output = DestinationCredential;

    async fn run(&mut self, tx: &mut Transaction) -> Result<QueryResult<DestinationCredential>, AppError> {
        let cred = data::destination_credentials::get_destination_credential(tx, self.id).await?;
        Ok(QueryResult {
            count: usize::from(cred.answered),
            update_index: cred.update_index,
            items: cred,
        })
    }
}

struct OpenRequests {
    destination_id: Id,
}

#[async_trait]
impl BlockingQuery for OpenRequests {
    type Output = Vec<DestinationCredential>;

    async fn run(&mut self, tx: &mut Transaction) -> Result<QueryResult<Vec<DestinationCredential>>, AppError> {
        let (creds, update_index) =
            data::destination_credentials::list_open_destination_credentials(tx, self.destination_id, Utc::now())
                .await?;
        Ok(QueryResult {
            count: creds.len(),
            items: creds,
            update_index,
        })
    }
}

/// True when the user holds any grant on the destination, directly or
/// through a group. Any matching grant row is enough.
async fn has_destination_grant(rctx: &mut RequestContext, user_id: Id, destination: &str) -> Result<bool, AppError> {
    let opts = ListGrantsOptions {
        by_subject: Some(Subject::User(user_id)),
        include_inherited_from_groups: true,
        by_destination: Some(destination.to_string()),
        exclude_connector_grant: true,
        ..ListGrantsOptions::default()
    };
    Ok(!data::grants::list_grants(&mut rctx.tx, &opts).await?.is_empty())
}

/// The user stops waiting when the request expires, since connectors ignore
/// expired requests, or at the request deadline if that comes first.
fn answer_deadline(request_deadline: Instant, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Instant {
    let remaining = (expires_at - now).to_std().unwrap_or_default();
    request_deadline.min(Instant::now() + remaining)
}

/// Ask the destination's connector for a credential and wait for the answer.
///
/// The request row is committed before waiting so the connector can see it.
/// No answer before the request deadline is `Timeout`.
#[instrument(skip(rctx))]
pub async fn create_destination_credential(
    rctx: &mut RequestContext,
    destination_name: &str,
) -> Result<DestinationCredential, AppError> {
    let user_id = rctx.user()?.id;
    if !has_destination_grant(rctx, user_id, destination_name).await? {
        return Err(ServiceError::Unauthorized(format!(
            "no grants on destination {}",
            destination_name
        ))
        .into());
    }
    let destination = data::destinations::get_destination_by_name(&mut rctx.tx, destination_name).await?;

    let cred =
        data::destination_credentials::create_destination_credential(&mut rctx.tx, user_id, destination.id).await?;
    rctx.checkpoint().await?;
    debug!(credential_id = %cred.id, destination_id = %destination.id, "Waiting for connector");

    let org_id = rctx.org_id()?;
    let timer = std::time::Instant::now();
    let answered = run_blocking_request(
        &rctx.db,
        org_id,
        &[Channel::DestinationCredentialResponse {
            org_id,
            credential_id: cred.id,
        }],
        0,
        answer_deadline(rctx.deadline, cred.request_expires_at, Utc::now()),
        "create_destination_credential",
        Answer { id: cred.id },
    )
    .await;
    let elapsed = timer.elapsed().as_secs_f64();

    match answered {
        Ok(result) if result.items.answered => {
            DESTINATION_CREDENTIAL_DURATION
                .with_label_values(&["answered"])
                .observe(elapsed);
            info!(credential_id = %cred.id, "Destination credential answered");
            Ok(result.items)
        }
        Ok(_) | Err(AppError::NotModified) => {
            DESTINATION_CREDENTIAL_DURATION
                .with_label_values(&["timeout"])
                .observe(elapsed);
            warn!(credential_id = %cred.id, destination = %destination.name, "No answer from connector");
            Err(AppError::Timeout(format!(
                "destination {} did not answer the credential request",
                destination.name
            )))
        }
        Err(e) => Err(e),
    }
}

/// The connector's long-poll for open requests on its destination.
#[instrument(skip(rctx), fields(destination = %query.destination, last_update_index = query.last_update_index))]
pub async fn list_destination_credentials(
    rctx: &mut RequestContext,
    query: &ListDestinationCredentialsQuery,
) -> Result<ListResponse<api::DestinationCredential>, AppError> {
    authorize(rctx, "list", "destination credentials", &[CONNECTOR_ROLE, ADMIN_ROLE]).await?;

    let destination = data::destinations::get_destination_by_name(&mut rctx.tx, &query.destination).await?;
    let org_id = rctx.org_id()?;
    let result = run_blocking_request(
        &rctx.db,
        org_id,
        &[Channel::DestinationCredentialRequest {
            org_id,
            destination_id: destination.id,
        }],
        query.last_update_index,
        rctx.deadline,
        "list_destination_credentials",
        OpenRequests {
            destination_id: destination.id,
        },
    )
    .await?;

    Ok(ListResponse::new(
        result.items.iter().map(DestinationCredential::to_api).collect(),
        result.update_index,
    ))
}

/// Record the connector's answer. A request that already has an answer keeps
/// it and the call is a no-op.
#[instrument(skip(rctx, req), fields(credential_id = %req.id))]
pub async fn answer_destination_credential(
    rctx: &mut RequestContext,
    req: &AnswerDestinationCredentialRequest,
) -> Result<(), AppError> {
    authorize(rctx, "answer", "destination credential", &[CONNECTOR_ROLE]).await?;

    if req.organization_id != rctx.org_id()? {
        return Err(ServiceError::Forbidden("destination credential belongs to another organization".into()).into());
    }
    let cred = data::destination_credentials::get_destination_credential(&mut rctx.tx, req.id).await?;
    if cred.request_expires_at < Utc::now() {
        return Err(ServiceError::Expired("destination credential request has expired".into()).into());
    }

    let stored = data::destination_credentials::answer_destination_credential(
        &mut rctx.tx,
        cred.id,
        &req.bearer_token,
        req.credential_expires_at,
    )
    .await?;
    if !stored {
        debug!(credential_id = %cred.id, "Request already answered");
    }
    Ok(())
}
