//! Common test utilities for the server crate.

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use silo_core::config::AppConfig;
use silo_server::{redirect_router, rivet_router, AppState};
use tempfile::TempDir;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const TEST_IDENTITY: &str = "testid";
pub const TEST_SECRET: &str = "test-secret";

/// A test server wrapper with all dependencies on temp storage.
#[allow(dead_code)]
pub struct TestServer {
    pub state: AppState,
    pub rivet: Router,
    pub redirect: Router,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server with the default test configuration.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after applying a tweak to the configuration.
    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path());
        tweak(&mut config);

        let backend = silo_storage::from_config(&config.storage)
            .await
            .expect("Failed to create storage backend");
        let dumps_backend = silo_storage::from_config(&silo_core::config::StorageConfig::Filesystem {
            path: config.dumps.path.clone(),
        })
        .await
        .expect("Failed to create dumps backend");
        let metadata = silo_metadata::from_config(&config.metadata)
            .await
            .expect("Failed to create metadata store");

        let state = AppState::new(config, backend, dumps_backend, metadata);
        let rivet = rivet_router(state.clone());
        let redirect = redirect_router(state.clone());

        Self {
            state,
            rivet,
            redirect,
            _temp_dir: temp_dir,
        }
    }
}

/// Current time in the RFC-3339 form the auth header carries.
pub fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .expect("formatting now() cannot fail")
}

/// A timestamp offset from now by `seconds` (may be negative).
#[allow(dead_code)]
pub fn iso_offset(seconds: i64) -> String {
    (OffsetDateTime::now_utc() + time::Duration::seconds(seconds))
        .format(&Rfc3339)
        .expect("formatting offset time cannot fail")
}

/// Build an authenticated POST with the standard Rivet headers.
#[allow(dead_code)]
pub fn rivet_post(
    target: &str,
    mac_target: &str,
    content_type: Option<&str>,
    payload: &[u8],
    auth: Option<String>,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(target)
        .header("Content-Length", payload.len());
    if let Some(content_type) = content_type {
        builder = builder.header("Content-Type", content_type);
    }
    let auth = auth.unwrap_or_else(|| {
        silo_server::auth::auth_header(TEST_SECRET, mac_target, TEST_IDENTITY, &now_iso(), payload)
    });
    builder
        .header("Rivet-Auth", auth)
        .body(Body::from(payload.to_vec()))
        .expect("request construction cannot fail")
}

/// Build an authenticated `/retrieve` request for a source/destination pair.
#[allow(dead_code)]
pub fn retrieve_request(source_url: &str, destination_path: &str) -> Request<Body> {
    let payload = serde_json::json!({
        "sourceUrl": source_url,
        "destinationPath": destination_path,
    })
    .to_string();
    rivet_post(
        "/retrieve",
        "/retrieve",
        Some("application/json; charset=utf-8"),
        payload.as_bytes(),
        None,
    )
}

/// Build an authenticated `/upload/{path}?{hash}` request.
#[allow(dead_code)]
pub fn upload_request(path: &str, hash_hex: &str, body: &[u8]) -> Request<Body> {
    let target = format!("/upload/{path}?{hash_hex}");
    let auth = silo_server::auth::auth_header(TEST_SECRET, &target, TEST_IDENTITY, &now_iso(), b"");
    Request::builder()
        .method("POST")
        .uri(&target)
        .header("Expect", "100-continue")
        .header("Content-Type", "application/octet-stream")
        .header("Content-Length", body.len())
        .header("Rivet-Auth", auth)
        .body(Body::from(body.to_vec()))
        .expect("request construction cannot fail")
}

/// Read a JSON response body.
#[allow(dead_code)]
pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body read cannot fail");
    serde_json::from_slice(&bytes).expect("response body should be JSON")
}
