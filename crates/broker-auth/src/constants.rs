//! Storage keys, TTLs and timing windows
//!
//! The credential TTL mirrors the provider's 90-day inactivity expiry for
//! refresh tokens: every write restarts the window, so a tenant that keeps
//! using the gateway never loses its credential to storage expiry.

use std::time::Duration;

/// Storage key prefix for encrypted credentials: `token:{tenant_id}`
pub const TOKEN_KEY_PREFIX: &str = "token:";

/// Storage key prefix for pending CSRF states: `oauth_state:{state}`
pub const STATE_KEY_PREFIX: &str = "oauth_state:";

/// Credential record TTL (90 days), restarted on every write
pub const CREDENTIAL_TTL_SECS: u64 = 90 * 24 * 60 * 60;

/// CSRF state TTL (10 minutes)
pub const STATE_TTL_SECS: u64 = 10 * 60;

/// An access token is refreshed once it is within this many seconds of expiry
pub const REFRESH_BUFFER_SECS: u64 = 5 * 60;

/// Window for a local interactive authorization round trip
pub const INTERACTIVE_TIMEOUT_SECS: u64 = 5 * 60;

/// Loopback port the interactive callback listener binds by default
pub const LOOPBACK_PORT: u16 = 3737;

/// Path the provider redirects to after authorization
pub const CALLBACK_PATH: &str = "/oauth/callback";

pub const CREDENTIAL_TTL: Duration = Duration::from_secs(CREDENTIAL_TTL_SECS);
pub const STATE_TTL: Duration = Duration::from_secs(STATE_TTL_SECS);

/// Storage key for a tenant's credential record.
pub fn token_key(tenant_id: &str) -> String {
    format!("{TOKEN_KEY_PREFIX}{tenant_id}")
}

/// Storage key for a pending CSRF state.
pub fn state_key(state: &str) -> String {
    format!("{STATE_KEY_PREFIX}{state}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_literals() {
        assert_eq!(CREDENTIAL_TTL_SECS, 7_776_000);
        assert_eq!(STATE_TTL_SECS, 600);
        assert_eq!(REFRESH_BUFFER_SECS, 300);
        assert_eq!(INTERACTIVE_TIMEOUT_SECS, 300);
    }

    #[test]
    fn key_formats() {
        assert_eq!(token_key("tenant-1"), "token:tenant-1");
        assert_eq!(state_key("abc"), "oauth_state:abc");
    }
}
