//! Per-tenant upstream forwarding
//!
//! Each tenant gets an `ApiSession` from the session registry. The session
//! resolves the tenant's access token through its `ScopedBroker`, strips
//! hop-by-hop headers and any caller-supplied credentials, injects
//! `Authorization: Bearer <token>` and forwards to the upstream API. The
//! upstream response is returned verbatim (including error status codes).
//!
//! A tenant without a usable token gets a 401 `authentication_required`
//! payload pointing at `/oauth/authorize` instead of an upstream call.

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use broker_sessions::{ScopedBroker, SessionHandler};
use tracing::{debug, error, instrument, warn};

use crate::error::ApiError;
use crate::metrics;
use crate::session::SESSION_HEADER;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request body size limit
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Attempts per request; only timeouts are retried
const MAX_ATTEMPTS: u32 = 3;

const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Where and how sessions forward requests.
#[derive(Clone)]
pub struct Upstream {
    pub client: reqwest::Client,
    pub url: String,
    pub timeout: Duration,
}

/// A tenant's protocol handler: forwards requests with the tenant's token.
pub struct ApiSession {
    broker: ScopedBroker,
    upstream: Upstream,
}

impl SessionHandler for ApiSession {
    fn close(&self) {
        debug!(tenant_id = self.broker.tenant_id(), "session handler closed");
    }
}

/// JSON error response with the gateway's proxy error type.
fn proxy_error(status: StatusCode, message: &str, request_id: &str) -> Response {
    ApiError::new(status, "proxy_error", message)
        .with_request_id(request_id)
        .into_response()
}

/// 401 telling the caller to authorize this session first.
fn authentication_required(tenant_id: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "authentication_required",
            "message": "no valid credential for this session; authorize first",
            "request_id": request_id,
        },
        "authorize_url": "/oauth/authorize",
        "session_id": tenant_id,
    });
    (
        StatusCode::UNAUTHORIZED,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

impl ApiSession {
    pub fn new(broker: ScopedBroker, upstream: Upstream) -> Self {
        Self { broker, upstream }
    }

    pub fn tenant_id(&self) -> &str {
        self.broker.tenant_id()
    }

    /// Forward an inbound request upstream on behalf of this tenant.
    ///
    /// Retry strategy: upstream timeouts get 2 retries with 100ms fixed backoff.
    #[instrument(skip_all, fields(request_id = %request_id, tenant_id = %self.tenant_id(), method = %request.method(), path = %request.uri().path()))]
    pub async fn forward(
        &self,
        request: axum::http::Request<axum::body::Body>,
        request_id: String,
    ) -> Response {
        let access_token = match self.broker.resolve_access_token().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("no usable credential, asking caller to authorize");
                return authentication_required(self.tenant_id(), &request_id);
            }
            Err(e) => {
                error!(error = %e, "credential resolution failed");
                return ApiError::from(e)
                    .with_request_id(&request_id)
                    .into_response();
            }
        };

        let method = request.method().clone();
        let uri = request.uri().clone();

        // Build the upstream URL by appending the request path and query
        let upstream_url = if let Some(pq) = uri.path_and_query() {
            format!("{}{}", self.upstream.url.trim_end_matches('/'), pq)
        } else {
            self.upstream.url.clone()
        };

        // Collect request headers, stripping hop-by-hop, host, session id
        // and whatever credential the caller sent
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in request.headers() {
            if !is_hop_by_hop(name.as_str()) && !is_gateway_owned(name.as_str()) {
                headers.insert(name.clone(), value.clone());
            }
        }

        let bearer = match HeaderValue::from_str(&format!("Bearer {access_token}")) {
            Ok(mut v) => {
                v.set_sensitive(true);
                v
            }
            Err(_) => {
                error!("stored access token is not a valid header value");
                return proxy_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "stored access token is not a valid header value",
                    &request_id,
                );
            }
        };
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to read request body");
                return proxy_error(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid request body: {e}"),
                    &request_id,
                );
            }
        };

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                warn!(attempt, "retrying after upstream timeout");
                tokio::time::sleep(RETRY_DELAY).await;
            }

            let req = self
                .upstream
                .client
                .request(method.clone(), &upstream_url)
                .headers(headers.clone())
                .timeout(self.upstream.timeout)
                .body(body_bytes.clone());

            match req.send().await {
                Ok(upstream_response) => {
                    let status = upstream_response.status();
                    let resp_headers = upstream_response.headers().clone();

                    return match upstream_response.bytes().await {
                        Ok(resp_body) => {
                            let mut response = Response::builder().status(status);
                            for (name, value) in &resp_headers {
                                if !is_hop_by_hop(name.as_str()) {
                                    response = response.header(name, value);
                                }
                            }
                            response
                                .body(axum::body::Body::from(resp_body))
                                .unwrap_or_else(|e| {
                                    proxy_error(
                                        StatusCode::INTERNAL_SERVER_ERROR,
                                        &format!("response build error: {e}"),
                                        &request_id,
                                    )
                                })
                        }
                        Err(e) => {
                            metrics::record_upstream_error("body_read");
                            error!(error = %e, "failed to read upstream response body");
                            proxy_error(
                                StatusCode::BAD_GATEWAY,
                                &format!("upstream response read error: {e}"),
                                &request_id,
                            )
                        }
                    };
                }
                Err(e) if e.is_timeout() && attempt < MAX_ATTEMPTS - 1 => continue,
                Err(e) if e.is_timeout() => {
                    metrics::record_upstream_error("timeout");
                    error!(error = %e, attempts = MAX_ATTEMPTS, "upstream timeout after all retries");
                    return proxy_error(
                        StatusCode::GATEWAY_TIMEOUT,
                        &format!(
                            "upstream timeout after {}s ({MAX_ATTEMPTS} attempts)",
                            self.upstream.timeout.as_secs()
                        ),
                        &request_id,
                    );
                }
                Err(e) => {
                    metrics::record_upstream_error("connection");
                    error!(error = %e, "upstream request failed");
                    return proxy_error(
                        StatusCode::BAD_GATEWAY,
                        &format!("upstream error: {e}"),
                        &request_id,
                    );
                }
            }
        }

        proxy_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unexpected retry exhaustion",
            &request_id,
        )
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Headers the gateway sets itself or keeps to its side of the hop.
fn is_gateway_owned(name: &str) -> bool {
    ["host", "authorization", SESSION_HEADER]
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
    }

    #[test]
    fn gateway_owned_headers() {
        assert!(is_gateway_owned("Authorization"));
        assert!(is_gateway_owned("Host"));
        assert!(is_gateway_owned("MCP-Session-Id"));
        assert!(!is_gateway_owned("Content-Type"));
        assert!(!is_gateway_owned("X-Custom"));
    }

    #[tokio::test]
    async fn authentication_required_points_to_authorize() {
        let response = authentication_required("tenant-1", "req_1");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "authentication_required");
        assert_eq!(json["authorize_url"], "/oauth/authorize");
        assert_eq!(json["session_id"], "tenant-1");
    }

    #[test]
    fn proxy_error_format() {
        let resp = proxy_error(StatusCode::GATEWAY_TIMEOUT, "upstream timeout", "req_abc123");
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
