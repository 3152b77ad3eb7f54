use super::{authorize, RequestContext};
use crate::data;
use crate::data::providers::ListProvidersOptions;
use crate::error::bad_request;
use crate::models::{Provider, ProviderKind, ADMIN_ROLE};
use chrono::Utc;
use service_core::api::{CreateProviderRequest, UpdateProviderRequest};
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::{info, instrument};

fn parse_kind(kind: &str) -> Result<ProviderKind, AppError> {
    match kind.parse::<ProviderKind>() {
        Ok(ProviderKind::Infra) => Err(bad_request("providers of kind infra are built in")),
        Ok(kind) => Ok(kind),
        Err(msg) => Err(bad_request(msg)),
    }
}

fn apply(provider: &mut Provider, req: &UpdateProviderRequest, kind: ProviderKind) {
    provider.name = req.name.trim().to_string();
    provider.kind = kind.to_string();
    provider.url = req.url.clone();
    provider.client_id = req.client_id.clone();
    provider.client_secret = req.client_secret.clone();
}

#[instrument(skip(rctx, req), fields(name = %req.name, kind = %req.kind))]
pub async fn create_provider(rctx: &mut RequestContext, req: &CreateProviderRequest) -> Result<Provider, AppError> {
    authorize(rctx, "create", "provider", &[ADMIN_ROLE]).await?;
    let kind = parse_kind(&req.kind)?;

    let now = Utc::now();
    let mut provider = Provider {
        id: Id::generate(),
        organization_id: rctx.org_id()?,
        created_at: now,
        updated_at: now,
        name: String::new(),
        kind: String::new(),
        url: String::new(),
        client_id: String::new(),
        client_secret: String::new(),
        auth_url: String::new(),
        scopes: vec!["openid".into(), "email".into()],
        private_key: String::new(),
        client_email: String::new(),
        domain_admin_email: String::new(),
        created_by: rctx.user()?.id,
    };
    apply(&mut provider, req, kind);
    data::providers::create_provider(&mut rctx.tx, &mut provider).await?;

    info!(provider_id = %provider.id, "Created provider");
    Ok(provider)
}

#[instrument(skip(rctx, req))]
pub async fn update_provider(
    rctx: &mut RequestContext,
    id: Id,
    req: &UpdateProviderRequest,
) -> Result<Provider, AppError> {
    authorize(rctx, "update", "provider", &[ADMIN_ROLE]).await?;
    let kind = parse_kind(&req.kind)?;

    let mut provider = data::providers::get_provider(&mut rctx.tx, id).await?;
    if provider.kind() == ProviderKind::Infra {
        return Err(bad_request("the infra provider can not be modified"));
    }
    apply(&mut provider, req, kind);
    data::providers::update_provider(&mut rctx.tx, &mut provider).await?;
    Ok(provider)
}

/// Providers are public so a login page can list them. Only non-secret
/// fields leave the server.
pub async fn get_provider(rctx: &mut RequestContext, id: Id) -> Result<Provider, AppError> {
    data::providers::get_provider(&mut rctx.tx, id).await
}

pub async fn list_providers(rctx: &mut RequestContext, name: Option<String>) -> Result<Vec<Provider>, AppError> {
    let opts = ListProvidersOptions {
        by_name: name,
        by_ids: Vec::new(),
        exclude_infra: true,
    };
    data::providers::list_providers(&mut rctx.tx, &opts).await
}

#[instrument(skip(rctx))]
pub async fn delete_provider(rctx: &mut RequestContext, id: Id) -> Result<(), AppError> {
    authorize(rctx, "delete", "provider", &[ADMIN_ROLE]).await?;
    data::providers::delete_provider(&mut rctx.tx, id).await?;
    info!(provider_id = %id, "Deleted provider");
    Ok(())
}
