use super::Principal;
use crate::error::AuthError;
use axum::{
    Extension,
    body::{Body, to_bytes},
    extract::Request,
    http::{HeaderMap, header::CONTENT_TYPE},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use url::form_urlencoded;

pub const CSRF_HEADER: &str = "csrf-token";
const CSRF_HEADER_ALT: &str = "x-csrf-token";
pub const CSRF_FORM_FIELD: &str = "csrf_token";
const MAX_FORM_BYTES: usize = 64 * 1024;

#[must_use]
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

fn header_token(headers: &HeaderMap) -> Option<String> {
    [CSRF_HEADER, CSRF_HEADER_ALT]
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

/// Constant-time check of the session's anti-forgery token. A form body is
/// buffered to read `csrf_token` and handed on unchanged.
pub async fn csrf(
    Extension(principal): Extension<Principal>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let (parts, body) = request.into_parts();

    let (presented, body) = match header_token(&parts.headers) {
        Some(token) => (Some(token), body),
        None if is_form(&parts.headers) => {
            let bytes = to_bytes(body, MAX_FORM_BYTES)
                .await
                .map_err(|err| AuthError::InputMalformed(format!("unreadable form body: {err}")))?;
            let token = form_urlencoded::parse(&bytes)
                .find(|(key, _)| key == CSRF_FORM_FIELD)
                .map(|(_, value)| value.into_owned());
            (token, Body::from(bytes))
        }
        None => (None, body),
    };

    if !presented.is_some_and(|token| tokens_match(&token, &principal.session.csrf_token)) {
        return Err(AuthError::Forbidden("csrf token missing or invalid"));
    }

    Ok(next.run(Request::from_parts(parts, body)).await)
}
