//! Per-tenant session handlers with idle eviction
//!
//! The registry owns every handler's lifecycle: it constructs handlers through
//! a factory on first use and calls `SessionHandler::close` exactly once when
//! an entry leaves the registry (idle sweep, explicit removal or shutdown).
//!
//! There is no background timer. Callers invoke `maybe_sweep` at the start of
//! request handling; it runs a full sweep at most once per sweep interval no
//! matter how many requests arrive.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use broker_auth::unix_now;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::broker::{CredentialBroker, ScopedBroker};

/// Sessions idle for longer than this are evicted (1 hour)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Minimum spacing between opportunistic sweeps (5 minutes)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// A protocol handler bound to one tenant.
pub trait SessionHandler: Send + Sync + 'static {
    /// Release resources held by the handler. Called once on eviction.
    fn close(&self) {}
}

struct SessionEntry<H> {
    handler: Arc<H>,
    /// Unix seconds
    last_accessed: u64,
}

type HandlerFactory<H> = Box<dyn Fn(ScopedBroker) -> H + Send + Sync>;

/// Registry of live per-tenant handlers.
pub struct SessionRegistry<H: SessionHandler> {
    entries: Mutex<HashMap<String, SessionEntry<H>>>,
    broker: CredentialBroker,
    factory: HandlerFactory<H>,
    idle_timeout: Duration,
    sweep_interval: Duration,
    /// Unix seconds of the last sweep; 0 means never
    last_sweep: AtomicU64,
}

impl<H: SessionHandler> SessionRegistry<H> {
    /// Create an empty registry with the default idle and sweep timings.
    pub fn new(
        broker: CredentialBroker,
        factory: impl Fn(ScopedBroker) -> H + Send + Sync + 'static,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            broker,
            factory: Box::new(factory),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            last_sweep: AtomicU64::new(0),
        }
    }

    pub fn with_timing(mut self, idle_timeout: Duration, sweep_interval: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self.sweep_interval = sweep_interval;
        self
    }

    /// The tenant's handler, creating it on first use.
    pub async fn get_or_create(&self, tenant_id: &str) -> Arc<H> {
        self.get_or_create_at(tenant_id, unix_now()).await
    }

    /// `get_or_create` against an explicit clock. Bumps `last_accessed`.
    pub async fn get_or_create_at(&self, tenant_id: &str, now: u64) -> Arc<H> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(tenant_id) {
            entry.last_accessed = now;
            return entry.handler.clone();
        }

        let handler = Arc::new((self.factory)(self.broker.scoped(tenant_id)));
        entries.insert(
            tenant_id.to_string(),
            SessionEntry {
                handler: handler.clone(),
                last_accessed: now,
            },
        );
        metrics::gauge!("broker_sessions_active").set(entries.len() as f64);
        info!(tenant_id, sessions = entries.len(), "session created");
        handler
    }

    /// Evict and close every entry idle for longer than the idle timeout.
    ///
    /// Returns the number of evicted sessions.
    pub async fn sweep(&self, now: u64) -> usize {
        let idle_secs = self.idle_timeout.as_secs();
        let evicted: Vec<(String, Arc<H>)> = {
            let mut entries = self.entries.lock().await;
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, e)| now.saturating_sub(e.last_accessed) > idle_secs)
                .map(|(id, _)| id.clone())
                .collect();
            let evicted = stale
                .into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e.handler)))
                .collect();
            metrics::gauge!("broker_sessions_active").set(entries.len() as f64);
            evicted
        };

        for (tenant_id, handler) in &evicted {
            debug!(tenant_id, "evicting idle session");
            handler.close();
        }

        if !evicted.is_empty() {
            metrics::counter!("broker_sessions_evicted_total").increment(evicted.len() as u64);
            info!(evicted = evicted.len(), "idle sessions evicted");
        }
        evicted.len()
    }

    /// Sweep if at least one sweep interval has passed since the last sweep.
    ///
    /// Returns `None` when throttled. Concurrent callers race on a
    /// compare-and-swap so only one of them sweeps.
    pub async fn maybe_sweep(&self, now: u64) -> Option<usize> {
        let last = self.last_sweep.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.sweep_interval.as_secs() {
            return None;
        }
        self.last_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(self.sweep(now).await)
    }

    /// Drop a tenant's session (logout). Returns whether one existed.
    pub async fn remove(&self, tenant_id: &str) -> bool {
        let removed = {
            let mut entries = self.entries.lock().await;
            let removed = entries.remove(tenant_id);
            metrics::gauge!("broker_sessions_active").set(entries.len() as f64);
            removed
        };

        match removed {
            Some(entry) => {
                entry.handler.close();
                info!(tenant_id, "session removed");
                true
            }
            None => false,
        }
    }

    /// Close every session. Used on process shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<SessionEntry<H>> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, e)| e).collect()
        };
        metrics::gauge!("broker_sessions_active").set(0.0);

        for entry in &drained {
            entry.handler.close();
        }
        info!(closed = drained.len(), "all sessions closed");
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_auth::{AuthorizationServer, CipherBox, CredentialStore, Error, GrantFuture};
    use kv_store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const T0: u64 = 1_700_000_000;

    struct NoServer;

    impl AuthorizationServer for NoServer {
        fn authorization_url(&self, state: &str) -> String {
            format!("https://provider.example/authorize?state={state}")
        }

        fn exchange_code<'a>(&'a self, _code: &'a str) -> GrantFuture<'a> {
            Box::pin(async { Err(Error::Network("offline".into())) })
        }

        fn refresh<'a>(&'a self, _refresh_token: &'a str) -> GrantFuture<'a> {
            Box::pin(async { Err(Error::Network("offline".into())) })
        }
    }

    struct CountingHandler {
        broker: ScopedBroker,
        closed: Arc<AtomicUsize>,
    }

    impl SessionHandler for CountingHandler {
        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        registry: SessionRegistry<CountingHandler>,
        created: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(CredentialStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(CipherBox::from_hex_key(KEY).unwrap()),
        ));
        let broker = CredentialBroker::new(store, Arc::new(NoServer));
        let created = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let (c, d) = (created.clone(), closed.clone());
        let registry = SessionRegistry::new(broker, move |broker| {
            c.fetch_add(1, Ordering::SeqCst);
            CountingHandler {
                broker,
                closed: d.clone(),
            }
        });

        Fixture {
            registry,
            created,
            closed,
        }
    }

    #[tokio::test]
    async fn same_tenant_reuses_handler() {
        let f = fixture();
        let a = f.registry.get_or_create_at("t1", T0).await;
        let b = f.registry.get_or_create_at("t1", T0 + 10).await;

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.created.load(Ordering::SeqCst), 1);
        assert_eq!(f.registry.len().await, 1);
    }

    #[tokio::test]
    async fn handlers_are_scoped_to_their_tenant() {
        let f = fixture();
        let a = f.registry.get_or_create_at("t1", T0).await;
        let b = f.registry.get_or_create_at("t2", T0).await;

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.broker.tenant_id(), "t1");
        assert_eq!(b.broker.tenant_id(), "t2");
        assert_eq!(f.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_entries() {
        let f = fixture();
        f.registry.get_or_create_at("idle", T0).await;
        f.registry.get_or_create_at("edge", T0 + 1).await;
        f.registry.get_or_create_at("busy", T0 + 3000).await;

        // "idle" is 3601s old, "edge" exactly 3600s
        let evicted = f.registry.sweep(T0 + 3601).await;
        assert_eq!(evicted, 1);
        assert_eq!(f.closed.load(Ordering::SeqCst), 1);
        assert_eq!(f.registry.len().await, 2);
    }

    #[tokio::test]
    async fn access_bumps_last_accessed() {
        let f = fixture();
        f.registry.get_or_create_at("t1", T0).await;
        f.registry.get_or_create_at("t1", T0 + 3000).await;

        assert_eq!(f.registry.sweep(T0 + 3601).await, 0);
        assert_eq!(f.registry.sweep(T0 + 6601).await, 1);
    }

    #[tokio::test]
    async fn evicted_tenant_gets_a_new_handler() {
        let f = fixture();
        let first = f.registry.get_or_create_at("t1", T0).await;
        f.registry.sweep(T0 + 4000).await;
        let second = f.registry.get_or_create_at("t1", T0 + 4000).await;

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(f.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn maybe_sweep_is_throttled() {
        let f = fixture();
        f.registry.get_or_create_at("t1", T0).await;

        // Never swept before, so the first call runs
        assert_eq!(f.registry.maybe_sweep(T0).await, Some(0));
        assert_eq!(f.registry.maybe_sweep(T0 + 299).await, None);
        assert_eq!(f.registry.maybe_sweep(T0 + 300).await, Some(0));

        assert_eq!(f.registry.maybe_sweep(T0 + 3700).await, Some(1));
        assert_eq!(f.registry.maybe_sweep(T0 + 3701).await, None);
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn custom_timing_is_honoured() {
        let f = fixture();
        let registry = f
            .registry
            .with_timing(Duration::from_secs(60), Duration::from_secs(10));
        registry.get_or_create_at("t1", T0).await;

        assert_eq!(registry.maybe_sweep(T0 + 61).await, Some(1));
        assert_eq!(registry.maybe_sweep(T0 + 65).await, None);
    }

    #[tokio::test]
    async fn remove_closes_handler() {
        let f = fixture();
        f.registry.get_or_create_at("t1", T0).await;

        assert!(f.registry.remove("t1").await);
        assert!(!f.registry.remove("t1").await);
        assert_eq!(f.closed.load(Ordering::SeqCst), 1);
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_closes_everything_once() {
        let f = fixture();
        for tenant in ["a", "b", "c"] {
            f.registry.get_or_create_at(tenant, T0).await;
        }

        f.registry.shutdown().await;
        assert_eq!(f.closed.load(Ordering::SeqCst), 3);
        assert!(f.registry.is_empty().await);

        f.registry.shutdown().await;
        assert_eq!(f.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrent_first_requests_create_one_handler() {
        let f = Arc::new(fixture());
        let mut handles = vec![];
        for _ in 0..10 {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                f.registry.get_or_create_at("t1", T0).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(f.created.load(Ordering::SeqCst), 1);
    }
}
