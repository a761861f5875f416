//! HTTP surface: handlers, the trust-scope filters and the outer layer stack.

pub mod handlers;
pub mod middleware;
mod openapi;
mod routes;
pub mod state;

pub use openapi::openapi;
pub use state::{AppState, GatewayConfig};

use crate::cli::telemetry;
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware::from_fn,
};
use handlers::root;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer, request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

const REQUEST_ID: &str = "x-request-id";

/// The full application: every scope wrapped in [`with_gateway_layers`].
#[must_use]
pub fn router(state: AppState) -> Router {
    let (router, _openapi) = routes::api_router().split_for_parts();
    with_gateway_layers(router, state)
}

/// Terminal 404 plus the outer stack every request passes: request ids,
/// tracing, shared state, rate limiting, counting and panic recovery.
#[must_use]
pub fn with_gateway_layers(router: Router, state: AppState) -> Router {
    router
        .fallback(root::not_found)
        .method_not_allowed_fallback(root::not_found)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static(REQUEST_ID),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    REQUEST_ID,
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state))
                .layer(from_fn(middleware::limit))
                .layer(from_fn(middleware::count))
                .layer(CatchPanicLayer::custom(middleware::handle_panic)),
        )
}

/// Serve the gateway until ctrl-c.
/// # Errors
/// Returns an error if the listener cannot be bound or the server fails
pub async fn new(port: u16, state: AppState) -> Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {err}");
        }
        info!("Gracefully shutdown");
    })
    .await?;

    telemetry::shutdown_tracer();

    Ok(())
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);
    let request_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = route,
        request_id
    )
}
