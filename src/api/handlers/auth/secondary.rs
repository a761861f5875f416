//! Secondary-factor validation for sessions that passed the password step.

use super::{
    session::resolve_session,
    types::{SecondaryAnswer, SecondaryQuery, TierResponse, U2fSignAnswer},
};
use crate::{
    api::{middleware::SessionContext, state::AppState},
    error::AuthError,
    factor::{FactorKind, FactorResponse, ValidationChallenge},
    store::{Db, Session},
};
use axum::{Extension, Json, extract::Query, http::HeaderMap};
use chrono::{DateTime, Utc};

/// Sessions that may start or answer a validation challenge.
async fn partial_session(
    headers: &HeaderMap,
    db: &Db,
    now: DateTime<Utc>,
) -> Result<Session, AuthError> {
    match resolve_session(headers, db, now).await? {
        SessionContext::Active(session) => Ok(session),
        SessionContext::Anonymous => Err(AuthError::Unauthenticated),
    }
}

#[utoipa::path(
    get,
    path = "/auth/secondary",
    params(SecondaryQuery),
    responses(
        (status = 200, description = "Validation challenge issued", body = ValidationChallenge),
        (status = 401, description = "No session"),
        (status = 403, description = "Session does not await a secondary factor or has no factor of that kind")
    ),
    tag = "auth"
)]
pub async fn begin_secondary(
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Query(query): Query<SecondaryQuery>,
) -> Result<Json<ValidationChallenge>, AuthError> {
    let kind = match query.factor.as_deref() {
        Some(value) => value.parse::<FactorKind>().map_err(AuthError::InputMalformed)?,
        None => FactorKind::HardwareKey,
    };
    let now = Utc::now();
    let session = partial_session(&headers, &db, now).await?;
    let challenge = state
        .engine()
        .begin_validation(&db, &session, kind, now)
        .await?;
    Ok(Json(challenge))
}

#[utoipa::path(
    post,
    path = "/auth/secondary",
    request_body = SecondaryAnswer,
    responses(
        (status = 200, description = "Session promoted", body = TierResponse),
        (status = 401, description = "No session"),
        (status = 403, description = "Challenge rejected")
    ),
    tag = "auth"
)]
pub async fn answer_secondary(
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Json(answer): Json<SecondaryAnswer>,
) -> Result<Json<TierResponse>, AuthError> {
    let now = Utc::now();
    let session = partial_session(&headers, &db, now).await?;
    let tier = state
        .engine()
        .finish_validation(&db, &session, answer.challenge_id, &answer.response, now)
        .await?;
    Ok(Json(TierResponse { tier }))
}

#[utoipa::path(
    get,
    path = "/auth/u2f/sign",
    responses(
        (status = 200, description = "Hardware key challenge issued", body = ValidationChallenge),
        (status = 401, description = "No session"),
        (status = 403, description = "No hardware key registered")
    ),
    tag = "auth"
)]
pub async fn begin_u2f_sign(
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
) -> Result<Json<ValidationChallenge>, AuthError> {
    let now = Utc::now();
    let session = partial_session(&headers, &db, now).await?;
    let challenge = state
        .engine()
        .begin_validation(&db, &session, FactorKind::HardwareKey, now)
        .await?;
    Ok(Json(challenge))
}

#[utoipa::path(
    post,
    path = "/auth/u2f/sign",
    request_body = U2fSignAnswer,
    responses(
        (status = 200, description = "Session promoted", body = TierResponse),
        (status = 401, description = "No session"),
        (status = 403, description = "Challenge rejected")
    ),
    tag = "auth"
)]
pub async fn answer_u2f_sign(
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Json(answer): Json<U2fSignAnswer>,
) -> Result<Json<TierResponse>, AuthError> {
    let now = Utc::now();
    let session = partial_session(&headers, &db, now).await?;
    let response = FactorResponse::HardwareKey {
        key_handle: answer.key_handle,
        counter: answer.counter,
        signature: answer.signature,
    };
    let tier = state
        .engine()
        .finish_validation(&db, &session, answer.challenge_id, &response, now)
        .await?;
    Ok(Json(TierResponse { tier }))
}
