//! API handlers, grouped by concern. Which scope a handler is mounted in is
//! decided by `api::routes`, not here.

pub mod auth;
pub mod health;
pub mod keybase;
pub mod root;
pub mod ssh;
