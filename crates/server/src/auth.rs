//! Rivet request authentication.
//!
//! Every Rivet request carries `Rivet-Auth: identity:base64(mac):date`,
//! where the MAC is HMAC-SHA-512 over the canonical string
//! `target[?query]:identity:date:payload` keyed with the tenant's shared
//! secret. Timestamps outside the replay window are rejected before any
//! MAC work happens.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::http::HeaderMap;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

type HmacSha512 = Hmac<Sha512>;

/// How far in the past a request timestamp may lie.
const MAX_AGE: Duration = Duration::minutes(5);
/// How far in the future a request timestamp may lie (clock skew).
const MAX_SKEW: Duration = Duration::minutes(2);

/// Verify a Rivet request, returning the authenticated identity.
///
/// `target` is the request path including any query string, exactly as it
/// participates in the MAC. `payload` is the raw request body (empty for
/// the upload endpoint, whose body is hashed rather than MACed).
pub fn authenticate(
    state: &AppState,
    target: &str,
    headers: &HeaderMap,
    payload: &[u8],
) -> ApiResult<String> {
    let header = headers
        .get("Rivet-Auth")
        .ok_or_else(|| ApiError::Unauthorized("Rivet-Auth header missing".to_string()))?
        .to_str()
        .map_err(|_| invalid("Malformed header"))?;

    let mut fields = header.splitn(3, ':');
    let identity = fields.next().ok_or_else(|| invalid("Not enough fields"))?;
    let mac_b64 = fields.next().ok_or_else(|| invalid("Not enough fields"))?;
    let date_str = fields.next().ok_or_else(|| invalid("Not enough fields"))?;

    let date = OffsetDateTime::parse(date_str, &Rfc3339)
        .map_err(|_| invalid("Could not parse date"))?;
    let now = OffsetDateTime::now_utc();
    if date < now - MAX_AGE {
        return Err(invalid("Too old"));
    }
    if date > now + MAX_SKEW {
        return Err(invalid("From future"));
    }

    let secret = state
        .config
        .users
        .get(identity)
        .ok_or_else(|| invalid("Bad access ID"))?;

    let their_mac = base64::engine::general_purpose::STANDARD
        .decode(mac_b64)
        .map_err(|_| invalid("Bad MAC"))?;

    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::internal(e, "constructing HMAC"))?;
    mac.update(target.as_bytes());
    mac.update(b":");
    mac.update(identity.as_bytes());
    mac.update(b":");
    mac.update(date_str.as_bytes());
    mac.update(b":");
    mac.update(payload);

    // Constant-time comparison.
    mac.verify_slice(&their_mac).map_err(|_| invalid("Bad MAC"))?;

    Ok(identity.to_string())
}

fn invalid(reason: &str) -> ApiError {
    ApiError::Unauthorized(format!("Rivet-Auth header invalid ({reason})"))
}

/// Compute the MAC a client would send for the given request parameters.
/// Shared with the test suites; this is the whole client side of the
/// handshake.
pub fn compute_mac(secret: &str, target: &str, identity: &str, date: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(target.as_bytes());
    mac.update(b":");
    mac.update(identity.as_bytes());
    mac.update(b":");
    mac.update(date.as_bytes());
    mac.update(b":");
    mac.update(payload);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Build a complete Rivet-Auth header value.
pub fn auth_header(secret: &str, target: &str, identity: &str, date: &str, payload: &[u8]) -> String {
    format!(
        "{}:{}:{}",
        identity,
        compute_mac(secret, target, identity, date, payload),
        date
    )
}
