//! Password, OIDC and password-reset logins, and keeping OIDC users in step
//! with their identity provider.

use super::credentials::{ensure_infra_provider_user, set_password};
use super::{authorize, RequestContext};
use crate::config::SessionConfig;
use crate::data;
use crate::data::access_keys::DeleteAccessKeys;
use crate::db::Transaction;
use crate::error::{bad_request, ServiceError};
use crate::models::access_key::{
    SCOPE_ALLOW_APPROVE_DEVICE_FLOW, SCOPE_ALLOW_CREATE_ACCESS_KEY, SCOPE_PASSWORD_RESET,
};
use crate::models::provider::ProviderKind;
use crate::models::{AccessKey, Identity, Organization, PasswordResetToken, ProviderUser, ADMIN_ROLE};
use crate::services::OidcClient;
use crate::utils::{check_password_requirements, verify_password, Password};
use chrono::{DateTime, Duration, Utc};
use service_core::api::{LoginRequest, LoginResponse, OidcCredentials, PasswordCredentials};
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::{info, instrument, warn};

/// A successful login: the new key (with its secret) and who it is for.
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub access_key: AccessKey,
    pub identity: Identity,
    pub organization: Organization,
    pub password_update_required: bool,
}

impl LoginResult {
    pub fn to_api(&self) -> LoginResponse {
        LoginResponse {
            user_id: self.identity.id,
            name: self.identity.name.clone(),
            access_key: self.access_key.token(),
            expires: self.access_key.expires_at,
            password_update_required: self.password_update_required,
            organization_name: self.organization.name.clone(),
        }
    }
}

fn login_scopes(password_update_required: bool) -> Vec<String> {
    let mut scopes = vec![
        SCOPE_ALLOW_CREATE_ACCESS_KEY.to_string(),
        SCOPE_ALLOW_APPROVE_DEVICE_FLOW.to_string(),
    ];
    if password_update_required {
        scopes.push(SCOPE_PASSWORD_RESET.to_string());
    }
    scopes
}

/// Mint a key for `identity`. `extension_seconds` of 0 disables the
/// inactivity window.
pub(crate) async fn issue_key(
    tx: &mut Transaction,
    identity: &Identity,
    provider_id: Id,
    expires_at: DateTime<Utc>,
    extension_seconds: i64,
    scopes: Vec<String>,
) -> Result<AccessKey, AppError> {
    let now = Utc::now();
    let mut key = AccessKey {
        issued_for: identity.id,
        issued_for_name: identity.name.clone(),
        provider_id,
        expires_at,
        extension_seconds,
        extension_deadline: (extension_seconds > 0)
            .then(|| (now + Duration::seconds(extension_seconds)).min(expires_at)),
        scopes,
        ..AccessKey::default()
    };
    data::access_keys::create_access_key(tx, &mut key).await?;
    Ok(key)
}

async fn issue_session_key(
    tx: &mut Transaction,
    session: &SessionConfig,
    identity: &Identity,
    provider_id: Id,
    password_update_required: bool,
) -> Result<AccessKey, AppError> {
    let expires_at = Utc::now() + Duration::seconds(session.duration.as_secs() as i64);
    issue_key(
        tx,
        identity,
        provider_id,
        expires_at,
        session.extension.as_secs() as i64,
        login_scopes(password_update_required),
    )
    .await
}

async fn finish_login(
    rctx: &mut RequestContext,
    mut identity: Identity,
    provider_id: Id,
    password_update_required: bool,
) -> Result<LoginResult, AppError> {
    data::identities::touch_last_seen(&mut rctx.tx, &mut identity, Utc::now()).await?;
    let access_key = issue_session_key(
        &mut rctx.tx,
        &rctx.session,
        &identity,
        provider_id,
        password_update_required,
    )
    .await?;
    let org_id = rctx.org_id()?;
    let organization = data::organizations::get_organization(&mut rctx.tx, org_id).await?;

    info!(identity_id = %identity.id, provider_id = %provider_id, "Login succeeded");
    Ok(LoginResult {
        access_key,
        identity,
        organization,
        password_update_required,
    })
}

/// Log in with exactly one of a password or an OIDC authorization code.
#[instrument(skip_all)]
pub async fn login(rctx: &mut RequestContext, req: &LoginRequest) -> Result<LoginResult, AppError> {
    match (&req.password_credentials, &req.oidc) {
        (Some(creds), None) => password_login(rctx, creds).await,
        (None, Some(creds)) => oidc_login(rctx, creds).await,
        _ => Err(bad_request("exactly one of passwordCredentials or oidc is required")),
    }
}

async fn password_login(rctx: &mut RequestContext, creds: &PasswordCredentials) -> Result<LoginResult, AppError> {
    // every miss looks the same to the caller
    let invalid = |e: AppError| -> AppError {
        if e.is_not_found() {
            ServiceError::InvalidCredentials.into()
        } else {
            e
        }
    };

    let identity = data::identities::get_identity_by_name(&mut rctx.tx, &creds.name)
        .await
        .map_err(invalid)?;
    let credential = data::credentials::get_credential_by_identity(&mut rctx.tx, identity.id)
        .await
        .map_err(invalid)?;
    if !verify_password(&Password::new(creds.password.as_str()), &credential.password_hash) {
        return Err(ServiceError::InvalidCredentials.into());
    }

    let provider = data::providers::get_infra_provider(&mut rctx.tx).await?;
    finish_login(rctx, identity, provider.id, credential.one_time_password).await
}

async fn oidc_login(rctx: &mut RequestContext, creds: &OidcCredentials) -> Result<LoginResult, AppError> {
    let provider = data::providers::get_provider(&mut rctx.tx, creds.provider_id).await?;
    if provider.kind() == ProviderKind::Infra {
        return Err(bad_request("the infra provider does not support oidc login"));
    }

    let client = rctx.oidc.client_for(&provider);
    let tokens = client.exchange_code(&creds.code, &creds.redirect_url).await?;

    let identity = match data::identities::get_identity_by_name(&mut rctx.tx, &tokens.email).await {
        Ok(identity) => identity,
        Err(e) if e.is_not_found() => {
            let mut identity = Identity::new(rctx.org_id()?, tokens.email.clone(), Id::default());
            data::identities::create_identity(&mut rctx.tx, &mut identity).await?;
            info!(identity_id = %identity.id, provider = %provider.name, "Created identity from provider login");
            identity
        }
        Err(e) => return Err(e),
    };

    let mut user = match data::providers::get_provider_user(&mut rctx.tx, provider.id, identity.id).await {
        Ok(user) => user,
        Err(e) if e.is_not_found() => {
            let mut user = ProviderUser {
                identity_id: identity.id,
                provider_id: provider.id,
                organization_id: identity.organization_id,
                email: tokens.email.clone(),
                groups: Vec::new(),
                last_update: Utc::now(),
                redirect_url: creds.redirect_url.clone(),
                access_token: tokens.access_token.clone(),
                refresh_token: tokens.refresh_token.clone(),
                expires_at: tokens.expires_at,
                active: true,
            };
            data::providers::create_provider_user(&mut rctx.tx, &mut user).await?;
            user
        }
        Err(e) => return Err(e),
    };
    user.email = tokens.email.clone();
    user.redirect_url = creds.redirect_url.clone();
    user.access_token = tokens.access_token;
    if !tokens.refresh_token.is_empty() {
        user.refresh_token = tokens.refresh_token;
    }
    user.expires_at = tokens.expires_at;

    sync_provider_user(&mut rctx.tx, client.as_ref(), &mut user).await?;
    finish_login(rctx, identity, provider.id, false).await
}

/// Refresh the user's provider tokens, re-read their profile, and mirror
/// their provider groups.
pub(crate) async fn sync_provider_user(
    tx: &mut Transaction,
    client: &dyn OidcClient,
    user: &mut ProviderUser,
) -> Result<(), AppError> {
    let (access_token, expires_at) = client.refresh_access_token(user).await?;
    user.access_token = access_token;
    user.expires_at = expires_at;

    let info = client.user_info(user).await?;
    data::groups::sync_provider_groups(tx, user.provider_id, user.identity_id, &info.groups).await?;

    if !info.email.is_empty() {
        user.email = info.email;
    }
    user.groups = info.groups;
    user.active = true;
    data::providers::update_provider_user(tx, user).await
}

/// Bring the caller up to date with the provider their key came from.
///
/// When the provider no longer accepts the user their keys and provider
/// record are removed and the call fails with `Unauthorized`. The removal is
/// committed even though the request fails. An unreachable provider is
/// `BadGateway` and changes nothing.
#[instrument(skip(rctx))]
pub async fn update_identity_info_from_provider(rctx: &mut RequestContext) -> Result<(), AppError> {
    let authenticated = rctx.authenticated()?;
    let user_id = authenticated.user.id;
    let provider_id = authenticated.access_key.provider_id;

    let provider = data::providers::get_provider(&mut rctx.tx, provider_id).await?;
    if provider.kind() == ProviderKind::Infra {
        return Ok(());
    }
    let client = rctx.oidc.client_for(&provider);
    let mut user = data::providers::get_provider_user(&mut rctx.tx, provider.id, user_id).await?;

    match sync_provider_user(&mut rctx.tx, client.as_ref(), &mut user).await {
        Ok(()) => Ok(()),
        Err(e @ AppError::BadGateway(_)) => Err(e),
        Err(e) => {
            warn!(error = %e, identity_id = %user_id, provider = %provider.name, "Provider rejected user, revoking access");
            data::access_keys::delete_access_keys(
                &mut rctx.tx,
                DeleteAccessKeys::ByProviderAndIssuedFor {
                    provider_id: provider.id,
                    issued_for: user_id,
                },
            )
            .await?;
            data::providers::delete_provider_user(&mut rctx.tx, provider.id, user_id).await?;
            rctx.checkpoint().await?;
            Err(ServiceError::Unauthorized(format!("session revoked by provider {}", provider.name)).into())
        }
    }
}

/// Delete the key the request was made with.
#[instrument(skip(rctx))]
pub async fn logout(rctx: &mut RequestContext) -> Result<(), AppError> {
    let key_id = rctx.authenticated()?.access_key.id;
    data::access_keys::delete_access_keys(&mut rctx.tx, DeleteAccessKeys::ById(key_id)).await?;
    Ok(())
}

/// Mint a reset token for the user named `email`. The caller hands it over.
#[instrument(skip(rctx))]
pub async fn create_password_reset_token(
    rctx: &mut RequestContext,
    email: &str,
) -> Result<PasswordResetToken, AppError> {
    authorize(rctx, "create", "password reset", &[ADMIN_ROLE]).await?;
    let identity = data::identities::get_identity_by_name(&mut rctx.tx, email).await?;
    data::credentials::create_password_reset_token(&mut rctx.tx, identity.id).await
}

/// Claim a reset token, set the new password, and log the user in.
#[instrument(skip_all)]
pub async fn complete_password_reset(
    rctx: &mut RequestContext,
    token: &str,
    password: &Password,
) -> Result<LoginResult, AppError> {
    let identity_id = data::credentials::claim_password_reset_token(&mut rctx.tx, token).await?;
    let mut identity = data::identities::get_identity(&mut rctx.tx, identity_id).await?;

    let settings = data::settings::get_settings(&mut rctx.tx).await?;
    if let Err(requirements) = check_password_requirements(password, &settings.password) {
        return Err(bad_request(format!(
            "password must contain at least {}",
            requirements.join(", ")
        )));
    }

    data::identities::set_verified(&mut rctx.tx, identity.id).await?;
    identity.verified = true;
    // whoever holds the token is the subject
    set_password(&mut rctx.tx, identity.id, password, false).await?;
    ensure_infra_provider_user(&mut rctx.tx, &identity).await?;

    let provider = data::providers::get_infra_provider(&mut rctx.tx).await?;
    finish_login(rctx, identity, provider.id, false).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_time_password_logins_carry_reset_scope() {
        let scopes = login_scopes(true);
        assert!(scopes.iter().any(|s| s == SCOPE_PASSWORD_RESET));
        assert!(scopes.iter().any(|s| s == SCOPE_ALLOW_CREATE_ACCESS_KEY));

        let scopes = login_scopes(false);
        assert!(!scopes.iter().any(|s| s == SCOPE_PASSWORD_RESET));
        assert!(scopes.iter().any(|s| s == SCOPE_ALLOW_APPROVE_DEVICE_FLOW));
    }
}
