use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use service_core::api::{DESTINATION_NAME_HEADER, VERSION_HEADER};
use service_core::error::AppError;

use crate::access::Authenticated;
use crate::data;
use crate::db::{Transaction, TxOptions};
use crate::models::{Identity, SCOPE_PASSWORD_RESET};
use crate::startup::AppState;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

/// A key minted by a password reset may only set the new password or log out.
fn allowed_with_reset_scope(method: &Method, path: &str, identity: &Identity) -> bool {
    let password_path = format!("/api/users/{}/password", identity.id);
    (method == Method::PUT && path == password_path) || (method == Method::POST && path == "/api/logout")
}

/// Connector calls double as its destination's heartbeat.
async fn touch_connector_destination(tx: &mut Transaction, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(name) = header_str(headers, DESTINATION_NAME_HEADER) else {
        return Ok(());
    };
    let version = header_str(headers, VERSION_HEADER).unwrap_or_default();
    match data::destinations::get_destination_by_name(tx, name).await {
        Ok(mut destination) => data::destinations::touch_destination(tx, &mut destination, version, Utc::now()).await,
        // Not registered yet; the connector creates it on startup.
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Resolve the bearer access key into an [`Authenticated`] caller.
///
/// Validation runs in a transaction of its own so the sliding expiry and
/// last-seen writes stick even when the handler later fails.
pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header")))?
        .to_string();

    let mut tx = state.db.begin(TxOptions::read_write()).await?;
    let access_key = data::access_keys::validate_access_key(&mut tx, &token).await?;

    let mut user = match data::identities::get_identity(&mut tx, access_key.issued_for).await {
        Ok(user) => user,
        Err(e) if e.is_not_found() => {
            return Err(AppError::Unauthorized(anyhow::anyhow!("access key identity no longer exists")));
        }
        Err(e) => return Err(e),
    };
    data::identities::touch_last_seen(&mut tx, &mut user, Utc::now()).await?;
    if user.is_connector() {
        touch_connector_destination(&mut tx, req.headers()).await?;
    }
    let organization = data::organizations::get_organization(&mut tx, access_key.organization_id).await?;
    tx.commit().await?;

    if access_key.has_scope(SCOPE_PASSWORD_RESET) && !allowed_with_reset_scope(req.method(), req.uri().path(), &user) {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "a new password is required before this access key can be used"
        )));
    }

    req.extensions_mut().insert(Authenticated {
        access_key,
        user,
        organization,
    });

    Ok(next.run(req).await)
}

/// Extractor for the caller resolved by [`auth_middleware`].
pub struct Auth(pub Authenticated);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Auth
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Authenticated>()
            .cloned()
            .map(Auth)
            .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("Authenticated caller missing from request extensions")))
    }
}
