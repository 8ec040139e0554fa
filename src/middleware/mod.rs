pub mod auth;
pub mod tracing;

pub use auth::{AuthenticatedUser, JwtVerifier};
pub use tracing::request_tracing;
