//! Auth handlers and supporting modules.
//!
//! Login is two-step: the password moves a session to `primary`, a secondary
//! factor moves it to `fully_authenticated`. Users without any registered
//! factor skip the second step. Session tokens travel in the
//! `zerogate_session` cookie (or as a bearer token); only their SHA-256 is
//! stored.

pub(crate) mod device;
pub mod password;
pub(crate) mod secondary;
pub(crate) mod session;
pub(crate) mod state;
pub mod types;
pub(crate) mod u2f;
pub(crate) mod utils;

pub use password::hash_password;
pub use session::SESSION_COOKIE_NAME;
