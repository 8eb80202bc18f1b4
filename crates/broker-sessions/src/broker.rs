//! Access-token resolution policy
//!
//! Per tenant, a stored credential is in one of the states of `TokenState`.
//! `classify` is the pure decision; `CredentialBroker` applies it against the
//! credential store and the authorization server.
//!
//! Refreshes are not serialized per tenant. Two requests that both see a
//! credential inside the refresh buffer will both call the provider, and the
//! later write wins. If the provider rotates refresh tokens, the slower
//! request can fail its refresh and degrade to "needs authorization" for that
//! one call.

use std::sync::Arc;

use broker_auth::{
    AuthorizationServer, Credential, CredentialStore, REFRESH_BUFFER_SECS, Result, unix_now,
};
use tracing::{debug, info, warn};

/// Freshness of a tenant's credential at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// No stored credential
    Unauthenticated,
    /// Access token usable as-is
    Valid,
    /// Within the refresh buffer (or past expiry) with a refresh token on hand
    RefreshDue,
    /// Within the refresh buffer (or past expiry) and no way to refresh
    NeedsAuthorization,
}

impl TokenState {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TokenState::Unauthenticated => "unauthenticated",
            TokenState::Valid => "valid",
            TokenState::RefreshDue => "refresh_due",
            TokenState::NeedsAuthorization => "needs_authorization",
        }
    }
}

/// Classify a credential at `now` (unix seconds).
///
/// A credential without `expires_at` never expires. Otherwise the access token
/// is reused only while `now < expires_at - REFRESH_BUFFER_SECS`.
pub fn classify(credential: Option<&Credential>, now: u64) -> TokenState {
    let Some(credential) = credential else {
        return TokenState::Unauthenticated;
    };

    match credential.expires_at {
        None => TokenState::Valid,
        Some(expires_at) if now < expires_at.saturating_sub(REFRESH_BUFFER_SECS) => {
            TokenState::Valid
        }
        Some(_) if credential.refresh_token.is_some() => TokenState::RefreshDue,
        Some(_) => TokenState::NeedsAuthorization,
    }
}

/// Token policy shared by every tenant.
///
/// Cheap to clone; the store and authorization server are shared via `Arc`.
#[derive(Clone)]
pub struct CredentialBroker {
    store: Arc<CredentialStore>,
    server: Arc<dyn AuthorizationServer>,
}

impl CredentialBroker {
    pub fn new(store: Arc<CredentialStore>, server: Arc<dyn AuthorizationServer>) -> Self {
        Self { store, server }
    }

    /// Bind the broker to one tenant.
    pub fn scoped(&self, tenant_id: impl Into<String>) -> ScopedBroker {
        ScopedBroker {
            tenant_id: tenant_id.into(),
            broker: self.clone(),
        }
    }

    /// Resolve a usable access token for `tenant_id`, refreshing if needed.
    ///
    /// `Ok(None)` means the tenant must (re-)authorize: no credential, expired
    /// without a refresh token, or the refresh itself failed. Storage and
    /// decryption failures propagate as errors.
    pub async fn resolve_access_token(&self, tenant_id: &str) -> Result<Option<String>> {
        self.resolve_access_token_at(tenant_id, unix_now()).await
    }

    /// `resolve_access_token` against an explicit clock.
    pub async fn resolve_access_token_at(
        &self,
        tenant_id: &str,
        now: u64,
    ) -> Result<Option<String>> {
        let credential = self.store.get_credential(tenant_id).await?;
        let state = classify(credential.as_ref(), now);

        match (state, credential) {
            (TokenState::Valid, Some(credential)) => Ok(Some(credential.access_token)),
            (TokenState::RefreshDue, Some(credential)) => {
                self.refresh(tenant_id, credential, now).await
            }
            (state, _) => {
                debug!(tenant_id, state = state.label(), "no usable access token");
                Ok(None)
            }
        }
    }

    async fn refresh(
        &self,
        tenant_id: &str,
        credential: Credential,
        now: u64,
    ) -> Result<Option<String>> {
        let Some(refresh_token) = credential.refresh_token.as_deref() else {
            return Ok(None);
        };

        debug!(tenant_id, "access token within refresh buffer, refreshing");
        let tokens = match self.server.refresh(refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(tenant_id, error = %e, "token refresh failed, re-authorization required");
                metrics::counter!("broker_token_refresh_total", "outcome" => "failure")
                    .increment(1);
                return Ok(None);
            }
        };

        let refreshed = Credential {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or(credential.refresh_token),
            expires_at: absolute_expiry(now, tokens.expires_in),
        };
        self.store.store_credential(tenant_id, &refreshed).await?;

        metrics::counter!("broker_token_refresh_total", "outcome" => "success").increment(1);
        info!(tenant_id, expires_at = ?refreshed.expires_at, "token refreshed");
        Ok(Some(refreshed.access_token))
    }

    /// Persist tokens from a completed authorization or refresh.
    ///
    /// `expires_in` is relative; it is turned into an absolute `expires_at`.
    pub async fn store_credential(
        &self,
        tenant_id: &str,
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
    ) -> Result<()> {
        self.store_credential_at(tenant_id, access_token, refresh_token, expires_in, unix_now())
            .await
    }

    pub async fn store_credential_at(
        &self,
        tenant_id: &str,
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
        now: u64,
    ) -> Result<()> {
        let credential = Credential {
            access_token,
            refresh_token,
            expires_at: absolute_expiry(now, expires_in),
        };
        self.store.store_credential(tenant_id, &credential).await?;
        info!(tenant_id, "credential stored");
        Ok(())
    }

    /// Whether any credential is stored, fresh or not.
    pub async fn is_authenticated(&self, tenant_id: &str) -> Result<bool> {
        Ok(self.store.get_credential(tenant_id).await?.is_some())
    }

    /// Forget the tenant's credential. No error if there was none.
    pub async fn clear_credential(&self, tenant_id: &str) -> Result<()> {
        self.store.delete_credential(tenant_id).await?;
        info!(tenant_id, "credential cleared");
        Ok(())
    }
}

/// Turn a provider `expires_in` into an absolute unix time, clamped at `u64::MAX`.
fn absolute_expiry(now: u64, expires_in: Option<u64>) -> Option<u64> {
    expires_in.map(|secs| now.saturating_add(secs))
}

/// A `CredentialBroker` bound to a single tenant, handed to session handlers.
#[derive(Clone)]
pub struct ScopedBroker {
    tenant_id: String,
    broker: CredentialBroker,
}

impl ScopedBroker {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub async fn resolve_access_token(&self) -> Result<Option<String>> {
        self.broker.resolve_access_token(&self.tenant_id).await
    }

    pub async fn is_authenticated(&self) -> Result<bool> {
        self.broker.is_authenticated(&self.tenant_id).await
    }

    pub async fn clear_credential(&self) -> Result<()> {
        self.broker.clear_credential(&self.tenant_id).await
    }
}

impl std::fmt::Debug for ScopedBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedBroker")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}
