use crate::error::AuthError;
use axum::{
    http::{StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
};

#[utoipa::path(
    get,
    path = "/robots.txt",
    responses(
        (status = 200, description = "Crawlers are not welcome", content_type = "text/plain")
    ),
    tag = "health"
)]
pub async fn robots() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        "User-agent: *\nDisallow: /\n",
    )
}

/// Terminal handler for anything no scope claims.
pub async fn not_found() -> AuthError {
    AuthError::NotFound
}
