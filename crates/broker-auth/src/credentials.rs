//! Encrypted credential storage and one-time CSRF state
//!
//! Credentials are written as JSON under `token:{tenant_id}` with their token
//! fields encrypted by `CipherBox`. `expiresAt` stays in clear so freshness can
//! be judged without decrypting. Every write restarts the 90-day TTL.
//!
//! CSRF states live under `oauth_state:{state}` for 10 minutes. Consumption is
//! a read followed by a delete against the underlying `KvStore`; two callbacks
//! racing on the same state can both observe it. The capability offers no
//! compare-and-remove, so this is accepted rather than papered over.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use kv_store::KvStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cipher::CipherBox;
use crate::constants::{CREDENTIAL_TTL, STATE_TTL, state_key, token_key};
use crate::error::{Error, Result};

/// A tenant's OAuth credential in plaintext.
///
/// Without a `refresh_token` the credential cannot be refreshed, only
/// replaced by a fresh authorization. `expires_at` is absolute unix seconds;
/// `None` means the access token is treated as non-expiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<u64>,
}

/// Persisted form of a `Credential`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedCredential {
    /// base64 ciphertext
    pub access_token: String,
    /// base64 ciphertext
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiration as unix timestamp in seconds, in clear
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Write time as unix timestamp in milliseconds
    pub encrypted_at: u64,
}

/// Durable, TTL-governed credential and CSRF state storage.
pub struct CredentialStore {
    kv: Arc<dyn KvStore>,
    cipher: Arc<CipherBox>,
}

impl CredentialStore {
    pub fn new(kv: Arc<dyn KvStore>, cipher: Arc<CipherBox>) -> Self {
        Self { kv, cipher }
    }

    /// Backend name for health reporting.
    pub fn backend(&self) -> &str {
        self.kv.id()
    }

    /// Encrypt and persist a credential, restarting its 90-day TTL.
    pub async fn store_credential(&self, tenant_id: &str, credential: &Credential) -> Result<()> {
        let record = EncryptedCredential {
            access_token: self.cipher.encrypt(&credential.access_token)?,
            refresh_token: credential
                .refresh_token
                .as_deref()
                .map(|t| self.cipher.encrypt(t))
                .transpose()?,
            expires_at: credential.expires_at,
            encrypted_at: unix_millis(),
        };

        let json = serde_json::to_string(&record)
            .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

        self.kv
            .put(&token_key(tenant_id), json, CREDENTIAL_TTL)
            .await?;
        debug!(
            tenant_id,
            has_refresh = credential.refresh_token.is_some(),
            expires_at = ?credential.expires_at,
            "stored credential"
        );
        Ok(())
    }

    /// Read and decrypt a tenant's credential.
    ///
    /// Returns `None` when nothing is stored. A corrupt ciphertext surfaces as
    /// `Error::Decryption` so tampering is never mistaken for "logged out".
    pub async fn get_credential(&self, tenant_id: &str) -> Result<Option<Credential>> {
        let Some(json) = self.kv.get(&token_key(tenant_id)).await? else {
            return Ok(None);
        };

        let record: EncryptedCredential = serde_json::from_str(&json)
            .map_err(|e| Error::CredentialParse(format!("parsing credential record: {e}")))?;

        let access_token = self.cipher.decrypt(&record.access_token).inspect_err(|e| {
            warn!(tenant_id, error = %e, "stored access token failed to decrypt");
        })?;
        let refresh_token = record
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.decrypt(t))
            .transpose()
            .inspect_err(|e| {
                warn!(tenant_id, error = %e, "stored refresh token failed to decrypt");
            })?;

        Ok(Some(Credential {
            access_token,
            refresh_token,
            expires_at: record.expires_at,
        }))
    }

    /// Remove a tenant's credential. Absent credentials are not an error.
    pub async fn delete_credential(&self, tenant_id: &str) -> Result<()> {
        self.kv.delete(&token_key(tenant_id)).await?;
        debug!(tenant_id, "deleted credential");
        Ok(())
    }

    /// Record a pending CSRF state bound to `tenant_id` for 10 minutes.
    pub async fn store_state(&self, state: &str, tenant_id: &str) -> Result<()> {
        self.kv
            .put(&state_key(state), tenant_id.to_string(), STATE_TTL)
            .await?;
        debug!(tenant_id, "stored oauth state");
        Ok(())
    }

    /// Look up and remove a CSRF state, returning the tenant it was issued for.
    ///
    /// Returns `None` for unknown, expired or already consumed states.
    pub async fn consume_state(&self, state: &str) -> Result<Option<String>> {
        let key = state_key(state);
        let tenant_id = self.kv.get(&key).await?;
        if tenant_id.is_some() {
            self.kv.delete(&key).await?;
        }
        Ok(tenant_id)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
