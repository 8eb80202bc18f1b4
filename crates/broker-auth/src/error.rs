//! Error types for credential encryption, storage and OAuth exchanges

/// Errors from credential and OAuth operations.
///
/// "Not authenticated" is never an error here: lookups that find nothing
/// return `None` so callers can fall back to issuing an authorization link.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cipher used before initialization, or key material is malformed
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Ciphertext is corrupt, truncated, tampered with, or from another key
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Token endpoint answered with a non-success status
    #[error("token endpoint returned {status}: {body}")]
    OAuthExchange { status: u16, body: String },

    /// Token endpoint answered 2xx with a body we could not parse
    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),

    /// Transport failure reaching the provider
    #[error("network error: {0}")]
    Network(String),

    /// Missing, mismatched or already consumed CSRF state
    #[error("CSRF check failed: {0}")]
    Csrf(String),

    /// Provider redirected back with `error` / `error_description`
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Interactive authorization did not complete in time
    #[error("authorization timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] kv_store::Error),

    /// Stored credential record is not valid JSON
    #[error("credential parse error: {0}")]
    CredentialParse(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
