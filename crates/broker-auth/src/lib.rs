//! OAuth credential library for the broker
//!
//! Provides token encryption, encrypted credential storage, the provider's
//! token grants and the interactive authorization flow. This crate has no
//! dependency on the gateway binary; it can be tested and used on its own.
//!
//! Credential flow:
//! 1. Gateway mints a state with `csrf::generate_state()` and records it via
//!    `CredentialStore::store_state()`
//! 2. User authorizes at `OAuthGateway::build_authorization_url()`
//! 3. Callback consumes the state with `CredentialStore::consume_state()`
//! 4. Gateway calls `OAuthGateway::exchange_code()` with the authorization code
//! 5. Credential encrypted by `CipherBox` and saved via
//!    `CredentialStore::store_credential()`
//! 6. Request-time refresh goes through `OAuthGateway::refresh()`

pub mod cipher;
pub mod constants;
pub mod credentials;
pub mod csrf;
pub mod error;
pub mod gateway;
pub mod interactive;

use std::time::{SystemTime, UNIX_EPOCH};

pub use cipher::CipherBox;
pub use constants::*;
pub use credentials::{Credential, CredentialStore, EncryptedCredential};
pub use csrf::generate_state;
pub use error::{Error, Result};
pub use gateway::{AuthorizationServer, GatewayConfig, GrantFuture, OAuthGateway, TokenResponse};
pub use interactive::{
    CallbackParams, CallbackQuery, InteractionFuture, UserInteraction, authorize_interactive,
};

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
