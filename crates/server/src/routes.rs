//! Route configuration.
//!
//! Two routers, served on separate binds like the original deployment:
//! the public redirect server and the Rivet protocol server.

use crate::error::ApiError;
use crate::state::AppState;
use crate::{redirect, rivet};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Router for the Rivet protocol server.
pub fn rivet_router(state: AppState) -> Router {
    Router::new()
        .route("/retrieve", post(rivet::retrieve).options(rivet::options))
        .route("/upload/{*path}", post(rivet::upload).options(rivet::options))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the public redirect server.
pub fn redirect_router(state: AppState) -> Router {
    Router::new()
        .route("/{identity}/{*name}", get(redirect::redirect))
        .fallback(redirect::malformed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}
