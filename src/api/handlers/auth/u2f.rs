//! Hardware key enrollment for fully authenticated sessions, plus the facet
//! list browsers fetch to trust the app id.

use super::types::{DeviceView, U2fRegisterAnswer, U2fRegisterQuery};
use crate::{
    api::{middleware::Principal, state::AppState},
    error::AuthError,
    factor::{RegistrationChallenge, engine::RegistrationResponse},
    store::Db,
};
use axum::{
    Extension, Json,
    extract::Query,
    http::header,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const FACETS_CONTENT_TYPE: &str = "application/fido.trusted-apps+json";

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FacetVersion {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TrustedFacet {
    pub version: FacetVersion,
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrustedFacets {
    pub trusted_facets: Vec<TrustedFacet>,
}

impl TrustedFacets {
    #[must_use]
    pub fn for_app(app_id: &str) -> Self {
        Self {
            trusted_facets: vec![TrustedFacet {
                version: FacetVersion { major: 1, minor: 0 },
                ids: vec![app_id.to_string()],
            }],
        }
    }
}

#[utoipa::path(
    get,
    path = "/auth/u2f/app.json",
    responses(
        (status = 200, description = "Facets trusted for the app id", body = TrustedFacets,
            content_type = "application/fido.trusted-apps+json")
    ),
    tag = "devices"
)]
pub async fn app_facets(Extension(state): Extension<AppState>) -> Response {
    let facets = TrustedFacets::for_app(state.engine().settings().app_id());
    (
        [(header::CONTENT_TYPE, FACETS_CONTENT_TYPE)],
        Json(facets),
    )
        .into_response()
}

#[utoipa::path(
    get,
    path = "/auth/u2f/register",
    params(U2fRegisterQuery),
    responses(
        (status = 200, description = "Registration challenge issued", body = RegistrationChallenge),
        (status = 401, description = "Not fully authenticated"),
        (status = 403, description = "CSRF token missing or invalid")
    ),
    tag = "devices"
)]
pub async fn begin_register(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<U2fRegisterQuery>,
) -> Result<Json<RegistrationChallenge>, AuthError> {
    let challenge = state
        .engine()
        .begin_registration(&db, &principal.session, query.name, Utc::now())
        .await?;
    Ok(Json(challenge))
}

#[utoipa::path(
    post,
    path = "/auth/u2f/register",
    request_body = U2fRegisterAnswer,
    responses(
        (status = 200, description = "Hardware key registered", body = DeviceView),
        (status = 401, description = "Not fully authenticated"),
        (status = 403, description = "CSRF or challenge failure")
    ),
    tag = "devices"
)]
pub async fn finish_register(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Extension(principal): Extension<Principal>,
    Json(answer): Json<U2fRegisterAnswer>,
) -> Result<Json<DeviceView>, AuthError> {
    let response = RegistrationResponse::HardwareKey {
        key_handle: answer.key_handle,
        public_key: answer.public_key,
        signature: answer.signature,
    };
    let record = state
        .engine()
        .finish_registration(
            &db,
            &principal.session,
            answer.challenge_id,
            &response,
            answer.name,
            Utc::now(),
        )
        .await?;
    Ok(Json(DeviceView::from(&record)))
}
