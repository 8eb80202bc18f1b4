//! OAuth HTTP surface
//!
//! Endpoints:
//! - GET  /oauth/authorize  start a flow for the caller's session, return the provider link
//! - GET  /oauth/callback   provider redirect: check state, exchange code, store credential
//! - GET  /oauth/status     whether the caller's session holds a credential
//! - POST /oauth/logout     clear the credential and drop the session handler

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use broker_auth::{
    AuthorizationServer, CALLBACK_PATH, CallbackQuery, CredentialStore, Error, STATE_TTL_SECS,
    generate_state,
};
use broker_sessions::{CredentialBroker, SessionRegistry};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::metrics;
use crate::proxy::ApiSession;
use crate::session;

/// Shared state for OAuth handlers.
#[derive(Clone)]
pub struct OAuthState {
    pub store: Arc<CredentialStore>,
    pub server: Arc<dyn AuthorizationServer>,
    pub broker: CredentialBroker,
    pub registry: Arc<SessionRegistry<ApiSession>>,
}

/// Build the OAuth router.
pub fn router(state: OAuthState) -> Router {
    Router::new()
        .route("/oauth/authorize", get(authorize))
        .route(CALLBACK_PATH, get(callback))
        .route("/oauth/status", get(status))
        .route("/oauth/logout", post(logout))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn require_session(headers: &HeaderMap) -> Result<String, ApiError> {
    session::session_id(headers).ok_or_else(|| {
        ApiError::invalid_request(format!("missing {} header", session::SESSION_HEADER))
    })
}

/// GET /oauth/authorize: mint a CSRF state bound to the session and return
/// the provider's authorization URL.
///
/// The session id comes from the request header or is generated; either way
/// it is returned so the caller can use it on subsequent requests.
async fn authorize(
    State(state): State<OAuthState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant_id = session::session_id_or_new(&headers);
    let csrf_state = generate_state();
    state.store.store_state(&csrf_state, &tenant_id).await?;

    let authorization_url = state.server.authorization_url(&csrf_state);
    info!(tenant_id, "authorization flow started");

    let response = json_response(
        StatusCode::OK,
        serde_json::json!({
            "authorization_url": authorization_url,
            "session_id": tenant_id,
            "expires_in": STATE_TTL_SECS,
        }),
    );
    Ok(session::attach(response, &tenant_id))
}

/// GET /oauth/callback: complete the flow the provider redirected back from.
async fn callback(
    State(state): State<OAuthState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    match complete_authorization(&state, query).await {
        Ok(tenant_id) => {
            metrics::record_authorization("success");
            info!(tenant_id, "authorization completed");
            let response = json_response(
                StatusCode::OK,
                serde_json::json!({
                    "status": "authorized",
                    "session_id": tenant_id,
                }),
            );
            Ok(session::attach(response, &tenant_id))
        }
        Err(e) => {
            metrics::record_authorization(outcome_label(&e));
            warn!(error = %e, "authorization callback failed");
            Err(e.into())
        }
    }
}

async fn complete_authorization(
    state: &OAuthState,
    query: CallbackQuery,
) -> broker_auth::Result<String> {
    let params = query.into_params()?;
    let tenant_id = state
        .store
        .consume_state(&params.state)
        .await?
        .ok_or_else(|| Error::Csrf("unknown, expired or already used state".into()))?;

    let tokens = state.server.exchange_code(&params.code).await?;
    state
        .broker
        .store_credential(
            &tenant_id,
            tokens.access_token,
            tokens.refresh_token,
            tokens.expires_in,
        )
        .await?;
    Ok(tenant_id)
}

fn outcome_label(err: &Error) -> &'static str {
    match err {
        Error::Csrf(_) => "csrf",
        Error::AuthorizationDenied(_) => "denied",
        Error::OAuthExchange { .. } | Error::Network(_) | Error::InvalidTokenResponse(_) => {
            "exchange_failed"
        }
        _ => "error",
    }
}

/// GET /oauth/status: report whether the session holds a credential.
async fn status(
    State(state): State<OAuthState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant_id = require_session(&headers)?;
    let authenticated = state.broker.is_authenticated(&tenant_id).await?;

    let response = json_response(
        StatusCode::OK,
        serde_json::json!({
            "session_id": tenant_id,
            "isAuthenticated": authenticated,
        }),
    );
    Ok(session::attach(response, &tenant_id))
}

/// POST /oauth/logout: forget the credential and tear down the session.
async fn logout(
    State(state): State<OAuthState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant_id = require_session(&headers)?;
    state.broker.clear_credential(&tenant_id).await?;
    let had_session = state.registry.remove(&tenant_id).await;
    info!(tenant_id, had_session, "session logged out");

    let response = json_response(
        StatusCode::OK,
        serde_json::json!({
            "session_id": tenant_id,
            "status": "logged_out",
        }),
    );
    Ok(session::attach(response, &tenant_id))
}
