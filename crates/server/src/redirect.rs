//! Public redirect endpoint.
//!
//! `GET /{identity}/{name}` resolves a tenant object name and answers a
//! 301 to the backend's public hash-addressed URL. Requests racing an
//! in-flight write for the same name wait on the coalescer first, so they
//! see the committed mapping rather than a spurious 404. Dump objects are
//! served directly rather than redirected.

use crate::error::ApiError;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use silo_metadata::NameMapRepo;
use silo_proxy::{is_dump_name, TenantStore};

/// Response header set when the request had to wait on an in-flight
/// write. Diagnostic only.
const WAITED_HEADER: &str = "Silo-Waited";

/// GET /{identity}/{*name}
pub async fn redirect(
    State(state): State<AppState>,
    Path((identity, name)): Path<(String, String)>,
) -> Response {
    if identity.is_empty() || name.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    if is_dump_name(&name) {
        return serve_dump(&state, &identity, &name).await;
    }

    let waited = state.coalescer.await_if_writing(&identity, &name).await;

    let hash = match state.metadata.get_mapping(&identity, &name).await {
        Ok(Some(hash)) => hash,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return ApiError::internal(e, "resolving redirect mapping").into_response(),
    };

    let location = format!(
        "{}/{}",
        state.config.server.public_url.trim_end_matches('/'),
        hash.blob_path()
    );
    let mut response = Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::CACHE_CONTROL, "public")
        .header(header::LOCATION, location);
    if waited {
        response = response.header(WAITED_HEADER, "true");
    }
    response
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Dumps are not content-addressed, so there is no public hash URL to
/// redirect to; stream them through directly.
async fn serve_dump(state: &AppState, identity: &str, name: &str) -> Response {
    let store = state.proxy.dumps();
    let meta = match store.metadata(identity, name).await {
        Ok(meta) => meta,
        Err(e) if e.is_not_found() => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return ApiError::internal(e, "reading dump metadata").into_response(),
    };
    let stream = match store.get_stream(identity, name).await {
        Ok(stream) => stream,
        Err(e) if e.is_not_found() => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return ApiError::internal(e, "streaming dump").into_response(),
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CACHE_CONTROL, "private, no-cache")
        .header(header::CONTENT_LENGTH, meta.size);
    if let Some(content_type) = meta.content_type {
        response = response.header(header::CONTENT_TYPE, content_type);
    }
    response
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Anything that does not parse as `/{identity}/{name}` is malformed.
pub async fn malformed() -> StatusCode {
    StatusCode::BAD_REQUEST
}
