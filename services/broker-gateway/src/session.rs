//! Session id header handling
//!
//! The tenant id travels in `MCP-Session-Id` on both requests and responses.
//! A request without it starts a new tenant with a random UUIDv4.

use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use tracing::warn;

/// Header carrying the tenant/session id
pub const SESSION_HEADER: &str = "mcp-session-id";

/// The session id from the request headers, if present and non-empty.
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// The request's session id, or a freshly generated one.
pub fn session_id_or_new(headers: &HeaderMap) -> String {
    session_id(headers).unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Echo the session id on a response so the caller can correlate later calls.
pub fn attach(mut response: Response, tenant_id: &str) -> Response {
    match HeaderValue::from_str(tenant_id) {
        Ok(value) => {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
        Err(e) => warn!(error = %e, "session id is not a valid header value"),
    }
    response
}
