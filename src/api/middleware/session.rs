use crate::{
    api::handlers::auth::session::resolve_session,
    error::AuthError,
    store::{Db, Session, Tier},
};
use axum::{Extension, extract::Request, middleware::Next, response::Response};
use chrono::Utc;

/// Outcome of session resolution, available to every session-scoped handler.
#[derive(Clone, Debug)]
pub enum SessionContext {
    Anonymous,
    Active(Session),
}

impl SessionContext {
    #[must_use]
    pub const fn tier(&self) -> Tier {
        match self {
            Self::Anonymous => Tier::Anonymous,
            Self::Active(session) => session.tier,
        }
    }

    #[must_use]
    pub const fn session(&self) -> Option<&Session> {
        match self {
            Self::Anonymous => None,
            Self::Active(session) => Some(session),
        }
    }
}

pub async fn session(
    Extension(db): Extension<Db>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let context = resolve_session(request.headers(), &db, Utc::now()).await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
