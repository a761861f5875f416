//! Request-level error taxonomy and its HTTP mapping.
//!
//! Every challenge failure (`ChallengeExpired`, `ChallengeConsumed`,
//! `SignatureInvalid`, `FactorNotFound`) is answered with the same `403` body;
//! the specific reason only goes to the `audit` log target, never to the
//! client.

use crate::factor::VerifyError;
use crate::store::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("malformed input: {0}")]
    InputMalformed(String),

    #[error("authentication required")]
    Unauthenticated,

    /// CSRF failures and privilege checks.
    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("challenge expired")]
    ChallengeExpired,

    #[error("challenge already consumed")]
    ChallengeConsumed,

    #[error("signature invalid: {0}")]
    SignatureInvalid(#[from] VerifyError),

    #[error("factor or challenge not found")]
    FactorNotFound,

    #[error("not found")]
    NotFound,

    #[error("rate limited")]
    RateLimited,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal fault: {0}")]
    InternalFault(String),
}

impl AuthError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InputMalformed(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_)
            | Self::ChallengeExpired
            | Self::ChallengeConsumed
            | Self::SignatureInvalid(_)
            | Self::FactorNotFound => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalFault(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error code returned to clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InputMalformed(_) => "malformed_input",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::ChallengeExpired
            | Self::ChallengeConsumed
            | Self::SignatureInvalid(_)
            | Self::FactorNotFound => "invalid_challenge",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::StoreUnavailable(_) => "unavailable",
            Self::InternalFault(_) => "internal_error",
        }
    }

    #[must_use]
    pub const fn is_challenge_failure(&self) -> bool {
        matches!(
            self,
            Self::ChallengeExpired
                | Self::ChallengeConsumed
                | Self::SignatureInvalid(_)
                | Self::FactorNotFound
        )
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::InternalFault(err.to_string())
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(detail) => Self::StoreUnavailable(detail),
            StoreError::Conflict(detail) => Self::InputMalformed(detail),
            StoreError::Internal(detail) => Self::InternalFault(detail),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            err if err.is_challenge_failure() => {
                warn!(target: "audit", reason = %err, "challenge rejected");
            }
            Self::StoreUnavailable(detail) => error!("Store unavailable: {detail}"),
            Self::InternalFault(detail) => error!("Internal fault: {detail}"),
            _ => {}
        }

        let body = match &self {
            Self::InputMalformed(message) => json!({ "error": self.code(), "message": message }),
            _ => json!({ "error": self.code() }),
        };

        (status, Json(body)).into_response()
    }
}
