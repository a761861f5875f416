//! Request filters composed into the trust scopes.
//!
//! Every filter reads what it needs from request extensions (the outermost
//! `Extension<AppState>` layer, then whatever earlier filters inserted) and
//! either continues the chain or halts it with an [`AuthError`].
//!
//! [`AuthError`]: crate::error::AuthError

mod authenticate;
mod counter;
mod csrf;
mod database;
mod limit;
mod recovery;
mod session;

pub use authenticate::{Principal, authenticate};
pub use counter::{RequestCounter, count};
pub use csrf::{CSRF_FORM_FIELD, CSRF_HEADER, csrf, tokens_match};
pub use database::database;
pub use limit::{NoopRateLimiter, RateLimitDecision, RateLimiter, WindowRateLimiter, limit};
pub use recovery::handle_panic;
pub use session::{SessionContext, session};

use super::handlers::auth::utils::extract_client_ip;
use axum::{extract::ConnectInfo, extract::Request};
use std::net::SocketAddr;

/// Identity used by the rate limiter and request counter. Forwarding headers
/// count only behind a trusted proxy; otherwise the peer address is used.
pub(crate) fn client_key(request: &Request, trust_proxy: bool) -> String {
    trust_proxy
        .then(|| extract_client_ip(request.headers()))
        .flatten()
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}
