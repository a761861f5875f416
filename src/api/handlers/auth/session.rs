//! Password login, session resolution and logout.

use super::{
    password::verify_password,
    types::{LoginRequest, LoginResponse, LogoutResponse},
    utils::{generate_csrf_token, generate_session_token, hash_session_token},
};
use crate::{
    api::{
        middleware::SessionContext,
        state::{AppState, GatewayConfig},
    },
    error::AuthError,
    store::{Db, Session, Store, Tier},
};
use axum::{
    Extension, Json,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{AUTHORIZATION, COOKIE, InvalidHeaderValue, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SESSION_COOKIE_NAME: &str = "zerogate_session";

#[utoipa::path(
    post,
    path = "/auth/session",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Password accepted", body = LoginResponse),
        (status = 401, description = "Unknown user or wrong password"),
        (status = 503, description = "Store unavailable")
    ),
    tag = "auth"
)]
pub async fn login(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, AuthError> {
    let username = request.username.trim().to_lowercase();
    if username.is_empty() || request.password.is_empty() {
        return Err(AuthError::InputMalformed(
            "username and password are required".to_string(),
        ));
    }

    let Some(user) = db.find_user_by_name(&username).await? else {
        info!(target: "audit", %username, "login rejected: unknown user");
        return Err(AuthError::Unauthenticated);
    };
    if !verify_password(user.password_hash.clone(), SecretString::from(request.password)).await? {
        info!(target: "audit", user_id = %user.id, "login rejected: bad password");
        return Err(AuthError::Unauthenticated);
    }

    let mut factors = Vec::new();
    for record in db.list_factors(user.id).await? {
        if !factors.contains(&record.kind()) {
            factors.push(record.kind());
        }
    }
    let tier = if factors.is_empty() {
        Tier::FullyAuthenticated
    } else {
        Tier::Primary
    };

    let now = Utc::now();
    let token = generate_session_token().map_err(AuthError::internal)?;
    let ttl = chrono::Duration::from_std(state.config().session_ttl()).map_err(AuthError::internal)?;
    let session = Session {
        id: Uuid::now_v7(),
        token_hash: hash_session_token(&token),
        user_id: user.id,
        tier,
        csrf_token: generate_csrf_token().map_err(AuthError::internal)?,
        created_at: now,
        expires_at: now + ttl,
    };
    db.insert_session(&session).await?;
    info!(target: "audit", user_id = %user.id, session_id = %session.id, %tier, "login accepted");

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        session_cookie(state.config(), &token).map_err(AuthError::internal)?,
    );
    let body = LoginResponse {
        tier,
        secondary: tier != Tier::FullyAuthenticated,
        factors,
        token,
    };
    Ok((StatusCode::OK, headers, Json(body)).into_response())
}

#[utoipa::path(
    get,
    path = "/logout",
    responses(
        (status = 200, description = "Session cleared", body = LogoutResponse)
    ),
    tag = "auth"
)]
pub async fn logout(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Extension(context): Extension<SessionContext>,
) -> Result<Response, AuthError> {
    let mut removed = 0;
    if let SessionContext::Active(session) = &context {
        db.delete_session(session.id).await?;
        removed = 1;
        info!(target: "audit", user_id = %session.user_id, session_id = %session.id, "logout");
    }
    Ok(cleared(state.config(), removed))
}

#[utoipa::path(
    get,
    path = "/logout_all",
    responses(
        (status = 200, description = "Every session of the user cleared", body = LogoutResponse),
        (status = 401, description = "No session")
    ),
    tag = "auth"
)]
pub async fn logout_all(
    Extension(state): Extension<AppState>,
    Extension(db): Extension<Db>,
    Extension(context): Extension<SessionContext>,
) -> Result<Response, AuthError> {
    let SessionContext::Active(session) = &context else {
        return Err(AuthError::Unauthenticated);
    };
    let removed = db.delete_user_sessions(session.user_id).await?;
    info!(target: "audit", user_id = %session.user_id, sessions = removed, "logout everywhere");
    Ok(cleared(state.config(), removed))
}

fn cleared(config: &GatewayConfig, sessions: u64) -> Response {
    // Always clear the cookie, even if the session record was missing.
    let mut headers = HeaderMap::new();
    match clear_session_cookie(config) {
        Ok(cookie) => {
            headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => warn!("Failed to build logout cookie: {err}"),
    }
    (StatusCode::OK, headers, Json(LogoutResponse { sessions })).into_response()
}

/// Resolve the presented token into a session. Missing, unknown and expired
/// tokens all resolve to anonymous; only store failures are errors.
///
/// # Errors
/// Returns [`AuthError::StoreUnavailable`] when the lookup fails.
pub async fn resolve_session(
    headers: &HeaderMap,
    store: &dyn Store,
    now: DateTime<Utc>,
) -> Result<SessionContext, AuthError> {
    let Some(token) = extract_session_token(headers) else {
        return Ok(SessionContext::Anonymous);
    };
    let Some(session) = store.find_session(&hash_session_token(&token)).await? else {
        return Ok(SessionContext::Anonymous);
    };
    if session.is_expired(now) {
        debug!("Session {} expired at {}", session.id, session.expires_at);
        store.delete_session(session.id).await?;
        return Ok(SessionContext::Anonymous);
    }
    Ok(SessionContext::Active(session))
}

/// Build a secure `HttpOnly` cookie for the session token.
pub(crate) fn session_cookie(
    config: &GatewayConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = config.session_ttl().as_secs();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

fn clear_session_cookie(config: &GatewayConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }
    let value = headers.get(COOKIE)?.to_str().ok()?;
    value.split(';').find_map(|pair| {
        let (key, val) = pair.trim().split_once('=')?;
        (key.trim() == SESSION_COOKIE_NAME && !val.trim().is_empty())
            .then(|| val.trim().to_string())
    })
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
