//! HTTP error payloads
//!
//! Every error the gateway returns to a caller has the shape
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`, with
//! `request_id` present only on proxied requests.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// An error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    request_id: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            request_id: None,
        }
    }

    /// A required request parameter or header is missing.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn body(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "type": self.kind,
            "message": self.message,
        });
        if let Some(request_id) = &self.request_id {
            error["request_id"] = serde_json::Value::String(request_id.clone());
        }
        serde_json::json!({ "error": error })
    }
}

impl From<broker_auth::Error> for ApiError {
    fn from(err: broker_auth::Error) -> Self {
        use broker_auth::Error;

        let (status, kind) = match &err {
            Error::Csrf(_) => (StatusCode::BAD_REQUEST, "csrf_error"),
            Error::AuthorizationDenied(_) => (StatusCode::BAD_REQUEST, "authorization_denied"),
            Error::OAuthExchange { .. } => (StatusCode::BAD_GATEWAY, "oauth_exchange_error"),
            Error::InvalidTokenResponse(_) => (StatusCode::BAD_GATEWAY, "invalid_token_response"),
            Error::Network(_) => (StatusCode::BAD_GATEWAY, "network_error"),
            Error::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            Error::Decryption(_) => (StatusCode::INTERNAL_SERVER_ERROR, "decryption_error"),
            Error::CredentialParse(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "credential_parse_error")
            }
            Error::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            Error::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error"),
        };
        Self::new(status, kind, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            self.body().to_string(),
        )
            .into_response()
    }
}
