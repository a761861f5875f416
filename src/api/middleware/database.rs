use crate::{
    api::state::AppState,
    error::AuthError,
    store::{Db, Store},
};
use axum::{Extension, extract::Request, middleware::Next, response::Response};

/// Attach a timeout-bounded [`Db`] handle; an unreachable store halts with 503.
pub async fn database(
    Extension(state): Extension<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let db = Db::new(state.store(), state.config().store_timeout());
    db.ping().await?;
    request.extensions_mut().insert(db);
    Ok(next.run(request).await)
}
