//! Trust scopes.
//!
//! `base ⊂ db ⊂ session ⊂ authenticated ⊂ csrf`. Each scope is a router whose
//! routes get that scope's filter through `route_layer`, then gets merged into
//! its parent so the parent's filters run first. Unmatched paths never reach a
//! scope filter: they hit the fallback and get a 404.

use super::{
    handlers::{
        auth::{device, secondary, session, state, u2f},
        health, keybase, root, ssh,
    },
    middleware::{authenticate, csrf, database, session as resolve},
    openapi::cargo_openapi,
};
use axum::middleware::from_fn;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Registration, revocation and approval: fully authenticated plus anti-forgery token.
fn csrf_scope() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(u2f::begin_register, u2f::finish_register))
        .routes(routes!(device::delete_device))
        .routes(routes!(keybase::validate, keybase::reject))
        .routes(routes!(keybase::associate))
        .routes(routes!(keybase::info))
        .routes(routes!(ssh::approve, ssh::deny))
        .routes(routes!(ssh::secondary))
        .route_layer(from_fn(csrf))
}

fn authenticated_scope() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(device::csrf_token))
        .routes(routes!(device::list_devices))
        .merge(csrf_scope())
        .route_layer(from_fn(authenticate))
}

fn session_scope() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(session::logout))
        .routes(routes!(session::logout_all))
        .merge(authenticated_scope())
        .route_layer(from_fn(resolve))
}

fn db_scope() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(session::login))
        .routes(routes!(secondary::begin_secondary, secondary::answer_secondary))
        .routes(routes!(secondary::begin_u2f_sign, secondary::answer_u2f_sign))
        .routes(routes!(keybase::check))
        .routes(routes!(
            keybase::request_certificate,
            keybase::redeem_certificate
        ))
        .routes(routes!(keybase::secondary))
        .routes(routes!(keybase::redeem_association))
        .routes(routes!(ssh::request_certificate, ssh::redeem_certificate))
        .routes(routes!(ssh::bind_host))
        .merge(session_scope())
        .route_layer(from_fn(database))
}

/// Every documented route, nested by scope.
pub(crate) fn api_router() -> OpenApiRouter {
    OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(state::auth_state))
        .routes(routes!(u2f::app_facets))
        .routes(routes!(health::check))
        .routes(routes!(root::robots))
        .merge(db_scope())
}
