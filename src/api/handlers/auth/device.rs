//! Registered factors of the current user, plus the CSRF token endpoint.

use super::types::{CsrfResponse, DeletedResponse, DeviceView};
use crate::{
    api::middleware::Principal,
    error::AuthError,
    store::{Db, Store},
};
use axum::{Extension, Json, extract::Path};
use tracing::info;
use uuid::Uuid;

#[utoipa::path(
    get,
    path = "/csrf",
    responses(
        (status = 200, description = "Anti-forgery token of the session", body = CsrfResponse),
        (status = 401, description = "Not fully authenticated")
    ),
    tag = "auth"
)]
pub async fn csrf_token(Extension(principal): Extension<Principal>) -> Json<CsrfResponse> {
    Json(CsrfResponse {
        csrf_token: principal.session.csrf_token,
    })
}

#[utoipa::path(
    get,
    path = "/device",
    responses(
        (status = 200, description = "Registered factors", body = [DeviceView]),
        (status = 401, description = "Not fully authenticated")
    ),
    tag = "devices"
)]
pub async fn list_devices(
    Extension(db): Extension<Db>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<DeviceView>>, AuthError> {
    let factors = db.list_factors(principal.user.id).await?;
    Ok(Json(factors.iter().map(DeviceView::from).collect()))
}

#[utoipa::path(
    delete,
    path = "/device/{device_id}",
    params(("device_id" = Uuid, Path, description = "Factor id")),
    responses(
        (status = 200, description = "Factor revoked", body = DeletedResponse),
        (status = 401, description = "Not fully authenticated"),
        (status = 403, description = "CSRF token missing or invalid"),
        (status = 404, description = "No such factor for this user")
    ),
    tag = "devices"
)]
pub async fn delete_device(
    Extension(db): Extension<Db>,
    Extension(principal): Extension<Principal>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<DeletedResponse>, AuthError> {
    // Administrators may revoke anyone's factor.
    let owner = (!principal.user.is_admin).then_some(principal.user.id);
    if !db.delete_factor(device_id, owner).await? {
        return Err(AuthError::NotFound);
    }
    info!(target: "audit", user_id = %principal.user.id, factor_id = %device_id, "factor revoked");
    Ok(Json(DeletedResponse {
        id: device_id,
        deleted: true,
    }))
}
