use super::{authorize, RequestContext};
use crate::data;
use crate::db::Transaction;
use crate::error::bad_request;
use crate::models::access_key::SCOPE_PASSWORD_RESET;
use crate::models::{Credential, Identity, ProviderUser, ADMIN_ROLE};
use crate::utils::{check_password_requirements, generate_one_time_password, hash_password, verify_password, Password};
use chrono::Utc;
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::{info, instrument};

/// Make sure `identity` is known to the built-in provider, which is what
/// lets it log in with a password.
pub(crate) async fn ensure_infra_provider_user(tx: &mut Transaction, identity: &Identity) -> Result<(), AppError> {
    let provider = data::providers::get_infra_provider(tx).await?;
    match data::providers::get_provider_user(tx, provider.id, identity.id).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            let mut user = ProviderUser {
                identity_id: identity.id,
                provider_id: provider.id,
                organization_id: identity.organization_id,
                email: identity.name.clone(),
                groups: Vec::new(),
                last_update: Utc::now(),
                redirect_url: String::new(),
                access_token: String::new(),
                refresh_token: String::new(),
                expires_at: None,
                active: true,
            };
            data::providers::create_provider_user(tx, &mut user).await
        }
        Err(e) => Err(e),
    }
}

/// Store `password` for `identity_id`, replacing any existing credential.
pub(crate) async fn set_password(
    tx: &mut Transaction,
    identity_id: Id,
    password: &Password,
    one_time: bool,
) -> Result<(), AppError> {
    let password_hash = hash_password(password)?;
    match data::credentials::get_credential_by_identity(tx, identity_id).await {
        Ok(mut credential) => {
            credential.password_hash = password_hash;
            credential.one_time_password = one_time;
            data::credentials::update_credential(tx, &credential).await
        }
        Err(e) if e.is_not_found() => {
            let mut credential = Credential {
                id: Id::generate(),
                organization_id: Id::default(),
                identity_id,
                password_hash,
                one_time_password: one_time,
            };
            data::credentials::create_credential(tx, &mut credential).await
        }
        Err(e) => Err(e),
    }
}

/// Give a user a generated one-time password. Returns it; it is not stored
/// anywhere in plain form.
#[instrument(skip(rctx))]
pub async fn create_credential(rctx: &mut RequestContext, identity_id: Id) -> Result<Password, AppError> {
    authorize(rctx, "create", "credential", &[ADMIN_ROLE]).await?;

    let identity = data::identities::get_identity(&mut rctx.tx, identity_id).await?;
    let password = generate_one_time_password();
    set_password(&mut rctx.tx, identity.id, &password, true).await?;
    ensure_infra_provider_user(&mut rctx.tx, &identity).await?;

    info!(identity_id = %identity.id, "Created one-time credential");
    Ok(password)
}

/// Set another user's password. The user must change it at next login.
#[instrument(skip(rctx, password))]
pub async fn reset_credential(
    rctx: &mut RequestContext,
    identity_id: Id,
    password: Option<&Password>,
) -> Result<Option<Password>, AppError> {
    authorize(rctx, "reset", "credential", &[ADMIN_ROLE]).await?;

    let identity = data::identities::get_identity(&mut rctx.tx, identity_id).await?;
    let generated = password.is_none().then(generate_one_time_password);
    if let Some(password) = password.or(generated.as_ref()) {
        set_password(&mut rctx.tx, identity.id, password, true).await?;
    }
    ensure_infra_provider_user(&mut rctx.tx, &identity).await?;

    info!(identity_id = %identity.id, "Reset credential");
    Ok(generated)
}

/// Change the caller's own password.
#[instrument(skip_all)]
pub async fn update_credential(
    rctx: &mut RequestContext,
    old_password: Option<&Password>,
    new_password: &Password,
) -> Result<(), AppError> {
    let authenticated = rctx.authenticated()?;
    let user_id = authenticated.user.id;
    let key_id = authenticated.access_key.id;

    let credential = data::credentials::get_credential_by_identity(&mut rctx.tx, user_id).await?;
    let old_matches = old_password.is_some_and(|old| verify_password(old, &credential.password_hash));
    if !old_matches {
        return Err(bad_request("invalid password"));
    }

    let settings = data::settings::get_settings(&mut rctx.tx).await?;
    if let Err(requirements) = check_password_requirements(new_password, &settings.password) {
        return Err(bad_request(format!(
            "password must contain at least {}",
            requirements.join(", ")
        )));
    }

    set_password(&mut rctx.tx, user_id, new_password, false).await?;
    data::access_keys::remove_scope(&mut rctx.tx, key_id, SCOPE_PASSWORD_RESET).await?;

    info!(identity_id = %user_id, "Updated password");
    Ok(())
}
