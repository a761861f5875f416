use super::types::AuthStateResponse;
use crate::{api::state::AppState, factor::FactorKind};
use axum::{Extension, Json};
use tracing::warn;

#[utoipa::path(
    get,
    path = "/auth/state",
    responses(
        (status = 200, description = "Enabled factors and relying-party metadata", body = AuthStateResponse)
    ),
    tag = "auth"
)]
pub async fn auth_state(Extension(state): Extension<AppState>) -> Json<AuthStateResponse> {
    let engine = state.engine();
    let ssh_certificate_authority = engine
        .authority()
        .public_key_openssh()
        .map_err(|err| warn!("Failed to encode SSH CA key: {err:#}"))
        .ok();

    Json(AuthStateResponse {
        factors: FactorKind::ALL.to_vec(),
        app_id: engine.settings().app_id().to_string(),
        service_name: engine.settings().service_name().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ssh_certificate_authority,
    })
}
