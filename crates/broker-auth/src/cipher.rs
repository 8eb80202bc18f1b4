//! AES-256-GCM encryption for tokens at rest
//!
//! Every call to `encrypt` draws a fresh 96-bit nonce, so encrypting the same
//! token twice never yields the same ciphertext. The wire form is
//! `base64(nonce ‖ ciphertext ‖ tag)`; the GCM tag covers the nonce, so a
//! swapped or flipped nonce fails authentication like any other tamper.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use rand::RngExt;

use crate::error::{Error, Result};

/// Key length in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Nonce length in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag length in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric authenticated encryption for short secrets.
///
/// Starts uninitialized; `encrypt`/`decrypt` fail with `Error::Configuration`
/// until `initialize` has accepted a key.
#[derive(Default)]
pub struct CipherBox {
    cipher: Option<Aes256Gcm>,
}

impl CipherBox {
    /// An uninitialized cipher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an initialized cipher from a hex-encoded 256-bit key.
    pub fn from_hex_key(key_hex: &str) -> Result<Self> {
        let mut cipher = Self::new();
        cipher.initialize(key_hex)?;
        Ok(cipher)
    }

    /// Install the key. The hex string must decode to exactly 32 bytes.
    pub fn initialize(&mut self, key_hex: &str) -> Result<()> {
        let key = Secret::new(
            hex::decode(key_hex)
                .map_err(|e| Error::Configuration(format!("encryption key is not valid hex: {e}")))?,
        );

        if key.expose().len() != KEY_SIZE {
            return Err(Error::Configuration(format!(
                "encryption key must be {KEY_SIZE} bytes (256 bits), got {} bytes",
                key.expose().len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key.expose())
            .map_err(|e| Error::Configuration(format!("failed to create cipher: {e}")))?;
        self.cipher = Some(cipher);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt UTF-8 text and return `base64(nonce ‖ ciphertext ‖ tag)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill(&mut nonce_bytes);

        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| Error::Configuration(format!("encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + sealed.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&sealed);
        Ok(STANDARD.encode(combined))
    }

    /// Reverse `encrypt`. Any malformed, truncated or tampered input fails
    /// with `Error::Decryption`.
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String> {
        let cipher = self.cipher()?;

        let combined = STANDARD
            .decode(ciphertext_b64)
            .map_err(|e| Error::Decryption(format!("invalid base64: {e}")))?;

        if combined.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Decryption(format!(
                "ciphertext too short: {} bytes",
                combined.len()
            )));
        }

        let (nonce, sealed) = combined.split_at(NONCE_SIZE);
        let plaintext = cipher.decrypt(Nonce::from_slice(nonce), sealed).map_err(|_| {
            Error::Decryption("authentication failed (tampered data or wrong key)".into())
        })?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Decryption(format!("plaintext is not UTF-8: {e}")))
    }

    fn cipher(&self) -> Result<&Aes256Gcm> {
        self.cipher
            .as_ref()
            .ok_or_else(|| Error::Configuration("encryption key not initialized".into()))
    }
}

impl std::fmt::Debug for CipherBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherBox")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
