//! Rivet protocol handlers.
//!
//! `POST /retrieve` asks the server to fetch a URL and pool the result;
//! `POST /upload/{path}` pushes bytes under a pre-committed hash. Both are
//! authenticated with [`crate::auth`] and answer JSON.

use crate::auth::authenticate;
use crate::error::{ApiError, ApiResult};
use crate::fetch::{FetchError, Retrieval, RivetResult, Temperature};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use silo_core::ContentHash;
use silo_metadata::NameMapRepo;
use silo_proxy::{hash_spool_raw, Spool};
use silo_storage::{ByteStream, StorageError};

/// Size ceiling for MAC-covered request bodies.
const MAX_BODY: usize = 8192;

/// Exact content type required on `/retrieve` bodies.
const RETRIEVE_CONTENT_TYPE: &str = "application/json; charset=utf-8";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveRequest {
    source_url: Option<String>,
    destination_path: Option<String>,
}

/// `OPTIONS` response shared by both endpoints: allowed method, no body.
pub async fn options() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ALLOW, "POST"),
            (header::ACCEPT, "application/json;charset=utf-8"),
        ],
    )
        .into_response()
}

/// POST /retrieve
pub async fn retrieve(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> ApiResult<Response> {
    // Read-only mode wins over everything else, before any work.
    if state.is_read_only() {
        return Err(ApiError::ReadOnly);
    }

    check_content_type(&headers, RETRIEVE_CONTENT_TYPE)?;
    let payload = read_limited_body(&headers, body).await?;
    let identity = authenticate(&state, "/retrieve", &headers, &payload)?;

    let request: RetrieveRequest = serde_json::from_slice(&payload)
        .map_err(|_| ApiError::BadRequest("Syntax error in payload".to_string()))?;
    let source_url = request
        .source_url
        .ok_or_else(|| ApiError::BadRequest("Must specify sourceUrl".to_string()))?;
    let destination_path = request
        .destination_path
        .ok_or_else(|| ApiError::BadRequest("Must specify destinationPath".to_string()))?;
    if !source_url.starts_with("https://") && !source_url.starts_with("http://") {
        return Err(ApiError::BadRequest(
            "sourceUrl must be http or https".to_string(),
        ));
    }

    let retrieval = state
        .retriever
        .retrieve(&source_url)
        .await
        .map_err(|e| map_fetch_error(e, &source_url, &identity))?;

    // Commit the mapping under the coalescer so redirect requests for the
    // destination block instead of racing the commit.
    {
        let _guard = state.coalescer.begin_write(&identity, &destination_path);
        state
            .metadata
            .put_mapping(&identity, &destination_path, &retrieval.hash)
            .await
            .map_err(|e| ApiError::internal(e, "committing retrieve mapping"))?;
    }

    tracing::info!(
        %identity,
        %source_url,
        %destination_path,
        result = ?retrieval.result,
        hash = %retrieval.hash,
        "rivet retrieve complete"
    );
    Ok(rivet_response(&retrieval, true))
}

/// POST /upload/{path}?{sha512-hex}
pub async fn upload(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    uri: axum::http::Uri,
    body: axum::body::Body,
) -> ApiResult<Response> {
    if state.is_read_only() {
        return Err(ApiError::ReadOnly);
    }

    // The 100-continue handshake lets us reject a bad request before the
    // client ships the payload; the body is only polled on the happy path.
    let expects_continue = headers
        .get(header::EXPECT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false);
    if !expects_continue {
        return Err(ApiError::BadRequest("Must expect continue".to_string()));
    }

    let query = uri.query().unwrap_or_default();
    if query.len() != 128 || !query.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(ApiError::BadRequest("Bad hash".to_string()));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::BadRequest("Content-Type required".to_string()))?;

    let target = format!("/upload/{path}?{query}");
    let identity = authenticate(&state, &target, &headers, b"")?;

    let declared = ContentHash::from_hex(query)
        .map_err(|_| ApiError::BadRequest("Bad hash".to_string()))?;

    let (result, temperature) = if state
        .metadata
        .hash_mapped(&declared)
        .await
        .map_err(|e| ApiError::internal(e, "checking declared hash"))?
    {
        // Already pooled; the body is never read.
        (RivetResult::Found, Temperature::Hot)
    } else {
        let stream: ByteStream = Box::pin(futures::TryStreamExt::map_err(
            body.into_data_stream(),
            |e| StorageError::Io(std::io::Error::other(e)),
        ));
        let spool = Spool::from_stream(stream)
            .await
            .map_err(|e| ApiError::internal(e, "spooling upload body"))?;
        let (spool, actual) = hash_spool_raw(spool)
            .await
            .map_err(|e| ApiError::internal(e, "hashing upload body"))?;

        if actual != declared {
            return Err(ApiError::BadRequest(format!(
                "Hash of body ({actual}) did not match hash in query ({declared})"
            )));
        }

        state
            .retriever
            .store_raw(&declared, spool, Some(&content_type))
            .await
            .map_err(|e| ApiError::internal(e, "storing uploaded payload"))?;
        (RivetResult::Added, Temperature::Freezing)
    };

    {
        let _guard = state.coalescer.begin_write(&identity, &path);
        state
            .metadata
            .put_mapping(&identity, &path, &declared)
            .await
            .map_err(|e| ApiError::internal(e, "committing upload mapping"))?;
    }

    tracing::info!(%identity, %path, result = ?result, hash = %declared, "rivet upload complete");
    let retrieval = Retrieval {
        hash: declared,
        result,
        temperature,
    };
    Ok(rivet_response(&retrieval, false))
}

fn rivet_response(retrieval: &Retrieval, include_hash: bool) -> Response {
    let mut body = serde_json::json!({
        "result": {
            "name": retrieval.result,
            "temperature": retrieval.temperature,
        }
    });
    if include_hash {
        body["hash"] = serde_json::Value::String(retrieval.hash.to_hex());
    }
    Json(body).into_response()
}

fn map_fetch_error(err: FetchError, source_url: &str, identity: &str) -> ApiError {
    match err {
        FetchError::IllegalHost(detail) => {
            tracing::warn!(identity, source_url, %detail, "rivet retrieve rejected");
            ApiError::BadRequest("Illegal host".to_string())
        }
        FetchError::UpstreamStatus { code, .. } => ApiError::UpstreamStatus(code),
        FetchError::UpstreamConnect => ApiError::UpstreamRefused,
        FetchError::UpstreamTimeout => ApiError::UpstreamTimeout,
        FetchError::TooManyRedirects => ApiError::UpstreamRefused,
        FetchError::Internal(detail) => ApiError::internal(
            detail,
            &format!("sourceUrl: {source_url}, identity: {identity}"),
        ),
    }
}

fn check_content_type(headers: &HeaderMap, expected: &str) -> ApiResult<()> {
    let normalized_expected = expected.replace(' ', "").to_ascii_lowercase();
    let actual = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.replace(' ', "").to_ascii_lowercase());
    match actual {
        Some(actual) if actual == normalized_expected => Ok(()),
        _ => Err(ApiError::UnsupportedMediaType(expected.to_string())),
    }
}

async fn read_limited_body(headers: &HeaderMap, body: axum::body::Body) -> ApiResult<Vec<u8>> {
    let length: usize = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(ApiError::LengthRequired)?;
    if length > MAX_BODY {
        return Err(ApiError::PayloadTooLarge);
    }
    let bytes = axum::body::to_bytes(body, MAX_BODY)
        .await
        .map_err(|_| ApiError::PayloadTooLarge)?;
    Ok(bytes.to_vec())
}
