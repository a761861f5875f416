use crate::error::AuthError;
use axum::response::{IntoResponse, Response};
use std::any::Any;

/// Turns a handler panic into a generic 500; used with `CatchPanicLayer::custom`.
#[allow(clippy::needless_pass_by_value)]
pub fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(ToString::to_string))
        .unwrap_or_else(|| "unknown panic payload".to_string());
    AuthError::InternalFault(format!("handler panicked: {detail}")).into_response()
}
