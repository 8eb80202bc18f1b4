//! Key-value capability used for credential persistence
//!
//! Defines the `KvStore` trait that decouples credential storage from any
//! particular backend. Every backend offers the same three operations with
//! per-write TTLs and no cross-key transactions:
//!
//! - `get(key)` returns the live value, or `None` if absent or expired
//! - `put(key, value, ttl)` replaces the value and restarts its TTL window
//! - `delete(key)` is idempotent
//!
//! `MemoryStore` serves tests and single-process deployments; `FileStore`
//! persists to a JSON file so credentials survive restarts.

pub mod error;
pub mod file;
pub mod memory;

pub use error::{Error, Result};
pub use file::FileStore;
pub use memory::MemoryStore;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by `KvStore` operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Abstraction over a TTL-governed key-value backend.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn KvStore>`).
/// Implementations are eventually consistent at best: a `get` followed by a
/// `delete` on the same key is two independent operations.
pub trait KvStore: Send + Sync {
    /// Backend name for logging and health reporting (e.g. "memory", "file")
    fn id(&self) -> &str;

    /// Read the value stored under `key`.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Write `value` under `key`, expiring it `ttl` from now.
    fn put<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;
}
