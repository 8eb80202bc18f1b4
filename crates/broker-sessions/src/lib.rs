//! Per-tenant token policy and session multiplexing
//!
//! `CredentialBroker` decides, per request, whether a tenant's stored access
//! token can be reused, must be refreshed, or requires a fresh authorization.
//! `SessionRegistry` owns one protocol handler per tenant, created lazily on
//! first use and torn down when the tenant goes idle.
//!
//! Request lifecycle:
//! 1. Request arrives tagged with a tenant id
//! 2. `SessionRegistry::maybe_sweep()` evicts idle tenants (throttled)
//! 3. `SessionRegistry::get_or_create()` returns the tenant's handler, bound
//!    to a `ScopedBroker`
//! 4. Handler calls `ScopedBroker::resolve_access_token()` before calling the
//!    upstream API; `None` means the caller must be sent to authorize

pub mod broker;
pub mod registry;

pub use broker::{CredentialBroker, ScopedBroker, TokenState, classify};
pub use registry::{SessionHandler, SessionRegistry};
