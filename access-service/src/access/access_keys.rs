use super::{authorize, authorize_self_or, RequestContext};
use crate::config::SessionConfig;
use crate::data;
use crate::data::access_keys::{DeleteAccessKeys, ListAccessKeysOptions};
use crate::error::{bad_request, ServiceError};
use crate::models::access_key::SCOPE_ALLOW_CREATE_ACCESS_KEY;
use crate::models::{AccessKey, ADMIN_ROLE, VIEW_ROLE};
use chrono::{DateTime, Duration, Utc};
use service_core::api::{CreateAccessKeyRequest, ListAccessKeysQuery};
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::{info, instrument};

struct Lifetime {
    expires_at: DateTime<Utc>,
    extension_seconds: i64,
    extension_deadline: Option<DateTime<Utc>>,
}

fn lifetime(now: DateTime<Utc>, req: &CreateAccessKeyRequest, session: &SessionConfig, connector: bool) -> Lifetime {
    let expiry = req
        .expiry_seconds
        .unwrap_or(session.duration.as_secs() as i64);
    let expires_at = now + Duration::seconds(expiry);

    let extension_seconds = match req.inactivity_timeout_seconds {
        Some(secs) => secs,
        None if connector => 0,
        None => session.extension.as_secs() as i64,
    };
    let extension_deadline =
        (extension_seconds > 0).then(|| (now + Duration::seconds(extension_seconds)).min(expires_at));

    Lifetime {
        expires_at,
        extension_seconds,
        extension_deadline,
    }
}

/// Mint a key for `req.user_id`. The returned key carries its secret.
#[instrument(skip(rctx, req), fields(user_id = %req.user_id))]
pub async fn create_access_key(
    rctx: &mut RequestContext,
    req: &CreateAccessKeyRequest,
) -> Result<AccessKey, AppError> {
    authorize_self_or(rctx, req.user_id, "create", "access key", &[ADMIN_ROLE]).await?;

    let identity = data::identities::get_identity(&mut rctx.tx, req.user_id).await?;
    let caller_key = &rctx.authenticated()?.access_key;
    if !caller_key.has_scope(SCOPE_ALLOW_CREATE_ACCESS_KEY) && !identity.is_connector() {
        return Err(ServiceError::Forbidden(format!(
            "access key is missing the {} scope",
            SCOPE_ALLOW_CREATE_ACCESS_KEY
        ))
        .into());
    }

    let provider = data::providers::get_infra_provider(&mut rctx.tx).await?;
    let Lifetime {
        expires_at,
        extension_seconds,
        extension_deadline,
    } = lifetime(Utc::now(), req, &rctx.session, identity.is_connector());

    let mut key = AccessKey {
        name: req.name.clone(),
        issued_for: identity.id,
        issued_for_name: identity.name.clone(),
        provider_id: provider.id,
        expires_at,
        extension_seconds,
        extension_deadline,
        ..AccessKey::default()
    };
    data::access_keys::create_access_key(&mut rctx.tx, &mut key).await?;

    info!(access_key_id = %key.id, name = %key.name, "Created access key");
    Ok(key)
}

#[instrument(skip(rctx))]
pub async fn list_access_keys(
    rctx: &mut RequestContext,
    query: &ListAccessKeysQuery,
) -> Result<Vec<AccessKey>, AppError> {
    match query.user_id {
        Some(id) => authorize_self_or(rctx, id, "list", "access keys", &[ADMIN_ROLE, VIEW_ROLE]).await?,
        None => authorize(rctx, "list", "access keys", &[ADMIN_ROLE, VIEW_ROLE]).await?,
    }

    let opts = ListAccessKeysOptions {
        by_issued_for: query.user_id,
        by_name: query.name.clone(),
        include_expired: query.show_expired,
    };
    data::access_keys::list_access_keys(&mut rctx.tx, &opts).await
}

async fn delete_key(rctx: &mut RequestContext, key: &AccessKey) -> Result<(), AppError> {
    if key.id == rctx.authenticated()?.access_key.id {
        return Err(bad_request("cannot delete the access key used by this request"));
    }
    authorize_self_or(rctx, key.issued_for, "delete", "access key", &[ADMIN_ROLE]).await?;
    data::access_keys::delete_access_keys(&mut rctx.tx, DeleteAccessKeys::ById(key.id)).await?;
    info!(access_key_id = %key.id, "Deleted access key");
    Ok(())
}

#[instrument(skip(rctx))]
pub async fn delete_access_key(rctx: &mut RequestContext, id: Id) -> Result<(), AppError> {
    let key = match data::access_keys::get_access_key(&mut rctx.tx, id).await {
        Ok(key) => key,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    delete_key(rctx, &key).await
}

#[instrument(skip(rctx))]
pub async fn delete_access_key_by_name(rctx: &mut RequestContext, name: &str) -> Result<(), AppError> {
    let opts = ListAccessKeysOptions {
        by_name: Some(name.to_string()),
        include_expired: true,
        ..ListAccessKeysOptions::default()
    };
    let keys = data::access_keys::list_access_keys(&mut rctx.tx, &opts).await?;
    for key in &keys {
        delete_key(rctx, key).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionConfig {
        SessionConfig {
            duration: std::time::Duration::from_secs(12 * 3600),
            extension: std::time::Duration::from_secs(3 * 3600),
        }
    }

    #[test]
    fn defaults_follow_the_session() {
        let now = Utc::now();
        let req = CreateAccessKeyRequest::default();
        let l = lifetime(now, &req, &session(), false);
        assert_eq!(l.expires_at, now + Duration::hours(12));
        assert_eq!(l.extension_seconds, 3 * 3600);
        assert_eq!(l.extension_deadline, Some(now + Duration::hours(3)));
    }

    #[test]
    fn connector_keys_do_not_slide() {
        let now = Utc::now();
        let l = lifetime(now, &CreateAccessKeyRequest::default(), &session(), true);
        assert_eq!(l.extension_seconds, 0);
        assert!(l.extension_deadline.is_none());
    }

    #[test]
    fn extension_deadline_never_passes_expiry() {
        let now = Utc::now();
        let req = CreateAccessKeyRequest {
            expiry_seconds: Some(60),
            inactivity_timeout_seconds: Some(3600),
            ..CreateAccessKeyRequest::default()
        };
        let l = lifetime(now, &req, &session(), false);
        assert_eq!(l.extension_deadline, Some(l.expires_at));
    }
}
