//! Linked external accounts.
//!
//! Linking runs out of band: a browser session creates an association token,
//! the external tool trades it for a registration challenge and signs it, and
//! the signature is submitted back from the browser. Linked accounts can then
//! answer login challenges and obtain SSH certificates without a browser
//! approval. When the account owner has hardware keys, the certificate
//! request answers 201 with a challenge that `PUT /keybase/secondary` settles.

use super::{
    auth::types::{DeviceView, U2fSignAnswer},
    ssh::{RedeemRequest, certificate_response, hardware_answer},
};
use crate::{
    api::{middleware::Principal, state::AppState},
    error::AuthError,
    factor::{
        IssuedCertificates, RegistrationChallenge, ValidationChallenge,
        engine::{AssociationGrant, AssociationInfo, CertificateRequest, RegistrationResponse},
        linked,
    },
    store::Db,
};
use axum::{Extension, Json, extract::Path, response::Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UsernameRequest {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LinkedResponse {
    pub username: String,
    pub linked: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LinkedKeyRequest {
    pub username: String,
    /// Ed25519 public key (URL-safe base64) for association, or an OpenSSH
    /// public key for certificate requests.
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ValidateRequest {
    pub challenge_id: Uuid,
    pub signature: String,
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RejectRequest {
    pub challenge_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RejectResponse {
    pub challenge_id: Uuid,
    pub rejected: bool,
}

#[utoipa::path(
    put,
    path = "/keybase/check",
    request_body = UsernameRequest,
    responses(
        (status = 200, description = "Whether the username is linked", body = LinkedResponse)
    ),
    tag = "keybase"
)]
pub async fn check(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Json(request): Json<UsernameRequest>,
) -> Result<Json<LinkedResponse>, AuthError> {
    let linked = state.engine().is_linked(&db, &request.username).await?;
    Ok(Json(LinkedResponse {
        username: linked::normalize_username(&request.username),
        linked,
    }))
}

#[utoipa::path(
    post,
    path = "/keybase/challenge",
    request_body = LinkedKeyRequest,
    responses(
        (status = 200, description = "Certificate request opened for a linked account", body = CertificateRequest),
        (status = 400, description = "Unparsable SSH public key"),
        (status = 403, description = "Username not linked")
    ),
    tag = "keybase"
)]
pub async fn request_certificate(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Json(request): Json<LinkedKeyRequest>,
) -> Result<Json<CertificateRequest>, AuthError> {
    let opened = state
        .engine()
        .request_linked_certificate(&db, &request.username, &request.public_key, Utc::now())
        .await?;
    Ok(Json(opened))
}

#[utoipa::path(
    put,
    path = "/keybase/challenge",
    request_body = RedeemRequest,
    responses(
        (status = 200, description = "Certificates issued", body = IssuedCertificates),
        (status = 201, description = "Hardware key must confirm the request", body = ValidationChallenge),
        (status = 403, description = "Challenge rejected")
    ),
    tag = "keybase"
)]
pub async fn redeem_certificate(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Json(request): Json<RedeemRequest>,
) -> Result<Response, AuthError> {
    let outcome = state
        .engine()
        .redeem_certificate(&db, request.token, &request.signature, Utc::now())
        .await?;
    Ok(certificate_response(outcome))
}

#[utoipa::path(
    put,
    path = "/keybase/secondary",
    request_body = U2fSignAnswer,
    responses(
        (status = 200, description = "Certificates issued", body = IssuedCertificates),
        (status = 403, description = "Challenge rejected")
    ),
    tag = "keybase"
)]
pub async fn secondary(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Json(answer): Json<U2fSignAnswer>,
) -> Result<Json<IssuedCertificates>, AuthError> {
    let (challenge_id, response) = hardware_answer(answer);
    let issued = state
        .engine()
        .finish_issuance_step_up(&db, challenge_id, &response, Utc::now())
        .await?;
    Ok(Json(issued))
}

#[utoipa::path(
    get,
    path = "/keybase/info/{token}",
    params(("token" = String, Path, description = "Association token, left unspent")),
    responses(
        (status = 200, description = "Pending association", body = AssociationInfo),
        (status = 401, description = "Not fully authenticated"),
        (status = 403, description = "CSRF failure, or an unknown, foreign or expired token")
    ),
    tag = "keybase"
)]
pub async fn info(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Extension(principal): Extension<Principal>,
    Path(token): Path<String>,
) -> Result<Json<AssociationInfo>, AuthError> {
    let info = state
        .engine()
        .association_info(&db, &principal.session, &token, Utc::now())
        .await?;
    Ok(Json(info))
}

#[utoipa::path(
    get,
    path = "/keybase/associate/{token}",
    params(("token" = String, Path, description = "Single-use association token")),
    responses(
        (status = 200, description = "Registration challenge for the linked account", body = RegistrationChallenge),
        (status = 403, description = "Unknown, used or expired token")
    ),
    tag = "keybase"
)]
pub async fn redeem_association(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Path(token): Path<String>,
) -> Result<Json<RegistrationChallenge>, AuthError> {
    let challenge = state
        .engine()
        .redeem_association(&db, &token, Utc::now())
        .await?;
    Ok(Json(challenge))
}

#[utoipa::path(
    post,
    path = "/keybase/associate",
    request_body = LinkedKeyRequest,
    responses(
        (status = 200, description = "Association token issued", body = AssociationGrant),
        (status = 400, description = "Bad username or key, or already linked"),
        (status = 401, description = "Not fully authenticated"),
        (status = 403, description = "CSRF token missing or invalid")
    ),
    tag = "keybase"
)]
pub async fn associate(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<LinkedKeyRequest>,
) -> Result<Json<AssociationGrant>, AuthError> {
    let grant = state
        .engine()
        .associate(
            &db,
            &principal.session,
            &request.username,
            &request.public_key,
            Utc::now(),
        )
        .await?;
    Ok(Json(grant))
}

#[utoipa::path(
    put,
    path = "/keybase/validate",
    request_body = ValidateRequest,
    responses(
        (status = 200, description = "Linked account registered", body = DeviceView),
        (status = 401, description = "Not fully authenticated"),
        (status = 403, description = "CSRF or challenge failure")
    ),
    tag = "keybase"
)]
pub async fn validate(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<ValidateRequest>,
) -> Result<Json<DeviceView>, AuthError> {
    let response = RegistrationResponse::LinkedAccount {
        signature: request.signature,
    };
    let record = state
        .engine()
        .finish_registration(
            &db,
            &principal.session,
            request.challenge_id,
            &response,
            request.name,
            Utc::now(),
        )
        .await?;
    Ok(Json(DeviceView::from(&record)))
}

#[utoipa::path(
    delete,
    path = "/keybase/validate",
    request_body = RejectRequest,
    responses(
        (status = 200, description = "Pending registration discarded", body = RejectResponse),
        (status = 401, description = "Not fully authenticated"),
        (status = 403, description = "CSRF or challenge failure")
    ),
    tag = "keybase"
)]
pub async fn reject(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<RejectResponse>, AuthError> {
    state
        .engine()
        .reject_registration(&db, &principal.session, request.challenge_id, Utc::now())
        .await?;
    Ok(Json(RejectResponse {
        challenge_id: request.challenge_id,
        rejected: true,
    }))
}
