//! CSRF state values for the authorization-code flow
//!
//! A state is 32 random bytes encoded as URL-safe base64 without padding, so
//! it can be placed in a query string and used as a storage key unescaped.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use subtle::ConstantTimeEq;

/// Random bytes per state value (256 bits)
const STATE_BYTES: usize = 32;

/// Generate an unguessable, single-use state value.
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compare an expected state with the one echoed back by the provider.
///
/// Runs in time independent of where the first differing byte sits.
pub fn states_match(expected: &str, returned: &str) -> bool {
    expected.as_bytes().ct_eq(returned.as_bytes()).into()
}
