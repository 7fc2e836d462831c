//! Authentication delegated to the external Auth Service.

mod client;
mod guard;

pub use client::{AuthError, AuthService, AuthUser, HttpAuthClient, Verdict};
pub use guard::{bearer_token, require_admin, require_auth, AuthGateway};
