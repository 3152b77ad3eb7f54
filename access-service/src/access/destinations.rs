use super::{authorize, RequestContext};
use crate::data;
use crate::data::destinations::ListDestinationsOptions;
use crate::models::{Destination, ADMIN_ROLE, CONNECTOR_ROLE};
use chrono::Utc;
use service_core::api::{CreateDestinationRequest, ListDestinationsQuery, UpdateDestinationRequest};
use service_core::error::AppError;
use service_core::uid::Id;
use tracing::{info, instrument};

const WRITE_ROLES: [&str; 2] = [CONNECTOR_ROLE, ADMIN_ROLE];

fn apply(destination: &mut Destination, req: &UpdateDestinationRequest) {
    destination.name = req.name.clone();
    destination.unique_id = req.unique_id.clone();
    destination.kind = req.kind.as_str().to_string();
    destination.connection_url = req.connection.url.clone();
    destination.connection_ca = req.connection.ca.clone();
    destination.resources = req.resources.clone();
    destination.roles = req.roles.clone();
    if !req.version.is_empty() {
        destination.version = req.version.clone();
    }
}

/// Register a destination. A connector re-registering under the same unique
/// ID updates its existing record.
#[instrument(skip(rctx, req), fields(name = %req.name, unique_id = %req.unique_id))]
pub async fn create_destination(
    rctx: &mut RequestContext,
    req: &CreateDestinationRequest,
) -> Result<Destination, AppError> {
    authorize(rctx, "create", "destination", &WRITE_ROLES).await?;

    if let Some(mut existing) = data::destinations::get_destination_by_unique_id(&mut rctx.tx, &req.unique_id).await? {
        apply(&mut existing, req);
        data::destinations::update_destination(&mut rctx.tx, &mut existing).await?;
        info!(destination_id = %existing.id, "Updated destination on re-registration");
        return Ok(existing);
    }

    let mut destination = Destination::from_request(rctx.org_id()?, req);
    destination.last_seen_at = Some(Utc::now());
    data::destinations::create_destination(&mut rctx.tx, &mut destination).await?;
    info!(destination_id = %destination.id, kind = %destination.kind, "Created destination");
    Ok(destination)
}

#[instrument(skip(rctx, req))]
pub async fn update_destination(
    rctx: &mut RequestContext,
    id: Id,
    req: &UpdateDestinationRequest,
) -> Result<Destination, AppError> {
    authorize(rctx, "update", "destination", &WRITE_ROLES).await?;

    let mut destination = data::destinations::get_destination(&mut rctx.tx, id).await?;
    apply(&mut destination, req);
    data::destinations::update_destination(&mut rctx.tx, &mut destination).await?;
    Ok(destination)
}

/// Any signed-in user may look up destinations; grants decide what they can
/// do there.
pub async fn get_destination(rctx: &mut RequestContext, id: Id) -> Result<Destination, AppError> {
    rctx.authenticated()?;
    data::destinations::get_destination(&mut rctx.tx, id).await
}

#[instrument(skip(rctx))]
pub async fn list_destinations(
    rctx: &mut RequestContext,
    query: &ListDestinationsQuery,
) -> Result<Vec<Destination>, AppError> {
    rctx.authenticated()?;
    let opts = ListDestinationsOptions {
        by_name: query.name.clone(),
        by_kind: query.kind.map(|k| k.as_str().to_string()),
        by_unique_id: query.unique_id.clone(),
    };
    data::destinations::list_destinations(&mut rctx.tx, &opts).await
}

#[instrument(skip(rctx))]
pub async fn delete_destination(rctx: &mut RequestContext, id: Id) -> Result<(), AppError> {
    authorize(rctx, "delete", "destination", &WRITE_ROLES).await?;
    data::destinations::delete_destination(&mut rctx.tx, id).await?;
    info!(destination_id = %id, "Deleted destination");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::api::{DestinationConnection, DestinationKind};

    #[test]
    fn apply_keeps_version_when_request_has_none() {
        let mut destination = Destination::from_request(
            Id::from_i64(1),
            &CreateDestinationRequest {
                unique_id: "u1".into(),
                name: "prod".into(),
                version: "0.1.0".into(),
                connection: DestinationConnection {
                    url: "10.0.0.1:443".into(),
                    ca: String::new(),
                },
                ..Default::default()
            },
        );
        let update = UpdateDestinationRequest {
            unique_id: "u1".into(),
            name: "prod".into(),
            kind: DestinationKind::Ssh,
            connection: DestinationConnection {
                url: "10.0.0.2:22".into(),
                ca: "ca".into(),
            },
            roles: vec!["admin".into()],
            ..Default::default()
        };
        apply(&mut destination, &update);
        assert_eq!(destination.version, "0.1.0");
        assert_eq!(destination.kind, "ssh");
        assert_eq!(destination.connection_url, "10.0.0.2:22");
        assert_eq!(destination.roles, vec!["admin".to_string()]);
    }
}
