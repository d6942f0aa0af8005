//! HTTP surface of the sandbox service.

mod auth;
pub mod ingress;
mod response;
mod router;
mod server;

#[cfg(test)]
mod testing;

pub use auth::require_bearer;
pub use response::{ApiError, success};
pub use router::{AppState, app_router};
pub use server::{serve, serve_on};
