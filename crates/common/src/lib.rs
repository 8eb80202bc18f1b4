//! Shared types for the OAuth credential broker workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
