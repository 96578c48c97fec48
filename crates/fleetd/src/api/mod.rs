//! HTTP API of the daemon.

mod auth;
mod error;
mod handlers;
mod routes;
mod state;

pub use auth::{ADMIN_ROLE, CurrentUser, RequireAdmin};
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
