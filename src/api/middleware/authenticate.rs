use super::SessionContext;
use crate::{
    error::AuthError,
    store::{Db, Session, Store, Tier, User},
};
use axum::{Extension, extract::Request, middleware::Next, response::Response};
use tracing::debug;

/// Fully authenticated caller.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user: User,
    pub session: Session,
}

/// Pass only fully authenticated sessions whose user still exists.
pub async fn authenticate(
    Extension(db): Extension<Db>,
    Extension(context): Extension<SessionContext>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let SessionContext::Active(session) = context else {
        return Err(AuthError::Unauthenticated);
    };
    if session.tier != Tier::FullyAuthenticated {
        debug!("Session {} at tier {} rejected", session.id, session.tier);
        return Err(AuthError::Unauthenticated);
    }
    let Some(user) = db.get_user(session.user_id).await? else {
        return Err(AuthError::Unauthenticated);
    };

    request.extensions_mut().insert(Principal { user, session });
    Ok(next.run(request).await)
}
