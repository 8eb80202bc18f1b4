//! OAuth authorization-code and refresh-token grants
//!
//! Handles the provider interactions:
//! 1. Authorization URL composition (no network)
//! 2. Authorization code exchange (initial OAuth flow completion)
//! 3. Token refresh (request-time, when the access token is near expiry)
//!
//! Both grants POST form-encoded bodies to the provider's token endpoint. No
//! state is kept between calls.

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Provider client registration and endpoints.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. Providers may
/// omit `refresh_token` on refresh, meaning the previous one stays valid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

/// Boxed future returned by token grants.
pub type GrantFuture<'a> = Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;

/// The external authorization server as seen by the broker.
///
/// `OAuthGateway` is the HTTP implementation; the seam lets the refresh policy
/// and the interactive flow run against an in-process fake.
pub trait AuthorizationServer: Send + Sync {
    /// Full authorization URL carrying `state`.
    fn authorization_url(&self, state: &str) -> String;

    /// Exchange an authorization code for tokens.
    fn exchange_code<'a>(&'a self, code: &'a str) -> GrantFuture<'a>;

    /// Obtain a new access token with a refresh token.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> GrantFuture<'a>;
}

/// HTTP client for the provider's authorization and token endpoints.
pub struct OAuthGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    authorize_url: Url,
}

impl OAuthGateway {
    /// Validate the endpoints and build the gateway.
    pub fn new(client: reqwest::Client, config: GatewayConfig) -> Result<Self> {
        let authorize_url = Url::parse(&config.authorization_endpoint).map_err(|e| {
            Error::Configuration(format!(
                "invalid authorization endpoint {}: {e}",
                config.authorization_endpoint
            ))
        })?;
        Url::parse(&config.token_endpoint).map_err(|e| {
            Error::Configuration(format!(
                "invalid token endpoint {}: {e}",
                config.token_endpoint
            ))
        })?;

        Ok(Self {
            client,
            config,
            authorize_url,
        })
    }

    pub fn redirect_uri(&self) -> &str {
        &self.config.redirect_uri
    }

    /// Compose `client_id`, `redirect_uri`, `response_type=code` and `state`
    /// onto the authorization endpoint. Deterministic for a given state.
    pub fn build_authorization_url(&self, state: &str) -> String {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("state", state);
        url.into()
    }

    /// Exchange an authorization code for tokens (initial OAuth flow).
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        self.token_request(
            "authorization_code",
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.config.client_id),
                ("client_secret", self.config.client_secret.expose()),
                ("redirect_uri", &self.config.redirect_uri),
            ],
        )
        .await
    }

    /// Refresh an access token using a refresh token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.token_request(
            "refresh_token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.config.client_id),
                ("client_secret", self.config.client_secret.expose()),
            ],
        )
        .await
    }

    async fn token_request(&self, grant: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        debug!(grant, endpoint = %self.config.token_endpoint, "calling token endpoint");

        let response = self
            .client
            .post(&self.config.token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{grant} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            warn!(grant, status = status.as_u16(), "token endpoint rejected grant");
            return Err(Error::OAuthExchange {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::InvalidTokenResponse(format!("{grant}: {e}")))
    }
}

impl AuthorizationServer for OAuthGateway {
    fn authorization_url(&self, state: &str) -> String {
        self.build_authorization_url(state)
    }

    fn exchange_code<'a>(&'a self, code: &'a str) -> GrantFuture<'a> {
        Box::pin(OAuthGateway::exchange_code(self, code))
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> GrantFuture<'a> {
        Box::pin(OAuthGateway::refresh(self, refresh_token))
    }
}
