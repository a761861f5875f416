//! SSH certificate requests.
//!
//! A client posts its public key and gets a token plus a message to sign.
//! The user approves or denies the token from a browser session; the client
//! polls `PUT /ssh/challenge` with its `SSHSIG` until the certificate comes
//! back (202 while approval is pending). A host may bind its own key to the
//! token first to receive a host certificate alongside. Users with hardware
//! keys confirm an approval through `PUT /ssh/secondary`.

use super::auth::types::U2fSignAnswer;
use crate::{
    api::{middleware::Principal, state::AppState},
    error::AuthError,
    factor::{
        CertificateOutcome, Decision, FactorResponse, IssuedCertificates, ValidationChallenge,
        engine::CertificateRequest,
    },
    store::Db,
};
use axum::{
    Extension, Json,
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SshChallengeRequest {
    /// OpenSSH public key, e.g. `ssh-ed25519 AAAA... user@host`.
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RedeemRequest {
    pub token: Uuid,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PendingResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HostRequest {
    pub token: Uuid,
    /// Host public key in OpenSSH format.
    pub public_key: String,
    pub hostnames: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HostResponse {
    pub token: Uuid,
    pub hostnames: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DecisionResponse {
    pub token: Uuid,
    pub fingerprint: String,
    pub approved: bool,
}

/// 200 with certificates, 201 with a hardware key challenge, or 202 while
/// approval is pending.
pub(crate) fn certificate_response(outcome: CertificateOutcome) -> Response {
    match outcome {
        CertificateOutcome::Pending => (
            StatusCode::ACCEPTED,
            Json(PendingResponse {
                status: "pending".to_string(),
            }),
        )
            .into_response(),
        CertificateOutcome::SecondaryRequired(challenge) => {
            (StatusCode::CREATED, Json(challenge)).into_response()
        }
        CertificateOutcome::Issued(issued) => (StatusCode::OK, Json(issued)).into_response(),
    }
}

pub(crate) fn hardware_answer(answer: U2fSignAnswer) -> (Uuid, FactorResponse) {
    (
        answer.challenge_id,
        FactorResponse::HardwareKey {
            key_handle: answer.key_handle,
            counter: answer.counter,
            signature: answer.signature,
        },
    )
}

#[utoipa::path(
    post,
    path = "/ssh/challenge",
    request_body = SshChallengeRequest,
    responses(
        (status = 200, description = "Certificate request opened", body = CertificateRequest),
        (status = 400, description = "Unparsable public key")
    ),
    tag = "ssh"
)]
pub async fn request_certificate(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Json(request): Json<SshChallengeRequest>,
) -> Result<Json<CertificateRequest>, AuthError> {
    let opened = state
        .engine()
        .request_certificate(&db, &request.public_key, Utc::now())
        .await?;
    Ok(Json(opened))
}

#[utoipa::path(
    put,
    path = "/ssh/challenge",
    request_body = RedeemRequest,
    responses(
        (status = 200, description = "Certificates issued", body = IssuedCertificates),
        (status = 202, description = "Awaiting approval", body = PendingResponse),
        (status = 403, description = "Challenge rejected")
    ),
    tag = "ssh"
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
    post,
    path = "/ssh/host",
    request_body = HostRequest,
    responses(
        (status = 200, description = "Host key bound to the request", body = HostResponse),
        (status = 400, description = "Bad host key or hostnames"),
        (status = 403, description = "Unknown, decided or expired request")
    ),
    tag = "ssh"
)]
pub async fn bind_host(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Json(request): Json<HostRequest>,
) -> Result<Json<HostResponse>, AuthError> {
    state
        .engine()
        .bind_host(
            &db,
            request.token,
            &request.public_key,
            &request.hostnames,
            Utc::now(),
        )
        .await?;
    Ok(Json(HostResponse {
        token: request.token,
        hostnames: request.hostnames,
    }))
}

async fn decide(
    state: &AppState,
    db: &Db,
    principal: &Principal,
    token: Uuid,
    approve: bool,
) -> Result<Response, AuthError> {
    let decision = state
        .engine()
        .approve_certificate(
            db,
            &principal.session,
            &principal.user,
            token,
            approve,
            Utc::now(),
        )
        .await?;
    Ok(match decision {
        Decision::Recorded { fingerprint } => Json(DecisionResponse {
            token,
            fingerprint,
            approved: approve,
        })
        .into_response(),
        Decision::SecondaryRequired(challenge) => {
            (StatusCode::CREATED, Json(challenge)).into_response()
        }
    })
}

#[utoipa::path(
    put,
    path = "/ssh/validate/{ssh_token}",
    params(("ssh_token" = Uuid, Path, description = "Certificate request token")),
    responses(
        (status = 200, description = "Request approved", body = DecisionResponse),
        (status = 201, description = "Hardware key must confirm the approval", body = ValidationChallenge),
        (status = 401, description = "Not fully authenticated"),
        (status = 403, description = "CSRF or challenge failure")
    ),
    tag = "ssh"
)]
pub async fn approve(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Extension(principal): Extension<Principal>,
    Path(ssh_token): Path<Uuid>,
) -> Result<Response, AuthError> {
    decide(&state, &db, &principal, ssh_token, true).await
}

#[utoipa::path(
    delete,
    path = "/ssh/validate/{ssh_token}",
    params(("ssh_token" = Uuid, Path, description = "Certificate request token")),
    responses(
        (status = 200, description = "Request denied", body = DecisionResponse),
        (status = 401, description = "Not fully authenticated"),
        (status = 403, description = "CSRF or challenge failure")
    ),
    tag = "ssh"
)]
pub async fn deny(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Extension(principal): Extension<Principal>,
    Path(ssh_token): Path<Uuid>,
) -> Result<Response, AuthError> {
    decide(&state, &db, &principal, ssh_token, false).await
}

#[utoipa::path(
    put,
    path = "/ssh/secondary",
    request_body = U2fSignAnswer,
    responses(
        (status = 200, description = "Request approved", body = DecisionResponse),
        (status = 401, description = "Not fully authenticated"),
        (status = 403, description = "CSRF or challenge failure")
    ),
    tag = "ssh"
)]
pub async fn secondary(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Extension(principal): Extension<Principal>,
    Json(answer): Json<U2fSignAnswer>,
) -> Result<Json<DecisionResponse>, AuthError> {
    let (challenge_id, response) = hardware_answer(answer);
    let (token, fingerprint) = state
        .engine()
        .finish_approval_step_up(
            &db,
            &principal.session,
            &principal.user,
            challenge_id,
            &response,
            Utc::now(),
        )
        .await?;
    Ok(Json(DecisionResponse {
        token,
        fingerprint,
        approved: true,
    }))
}
