//! OAuth Broker Gateway
//!
//! Single-binary Rust service that:
//! 1. Runs the OAuth authorization-code flow per session (`/oauth/*`)
//! 2. Stores each session's tokens encrypted at rest
//! 3. Refreshes access tokens on demand
//! 4. Proxies every other request to the upstream API with the session's
//!    bearer token injected
//!
//! `oauth-broker-gateway authorize --tenant <id>` runs the same flow once for
//! a local user through a loopback listener instead of serving HTTP.

mod config;
mod error;
mod loopback;
mod metrics;
mod proxy;
mod routes;
mod session;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::middleware::{self as axum_middleware, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use broker_auth::{CipherBox, CredentialStore, GatewayConfig, OAuthGateway, unix_now};
use broker_sessions::{CredentialBroker, SessionRegistry};
use kv_store::{FileStore, KvStore, MemoryStore};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, StoreBackend};
use crate::loopback::LoopbackChannel;
use crate::proxy::{ApiSession, Upstream};
use crate::routes::OAuthState;

/// How long in-flight requests get to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide counters for the health endpoint
struct GatewayStats {
    requests_total: AtomicU64,
    started_at: Instant,
}

impl GatewayStats {
    fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

/// Shared application state accessible from the non-OAuth handlers
#[derive(Clone)]
struct AppState {
    registry: Arc<SessionRegistry<ApiSession>>,
    stats: Arc<GatewayStats>,
    prometheus: PrometheusHandle,
    store_backend: String,
}

/// What the process was asked to do
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Serve,
    Authorize {
        tenant_id: Option<String>,
        open_browser: bool,
    },
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config_path: Option<String>,
    command: Command,
}

/// Parse `[authorize [--tenant <id>] [--no-browser]] [--config <path>]`.
fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config_path = None;
    let mut authorize = false;
    let mut tenant_id = None;
    let mut open_browser = true;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(iter.next().context("--config requires a path")?.clone());
            }
            "authorize" => authorize = true,
            "--tenant" if authorize => {
                tenant_id = Some(iter.next().context("--tenant requires an id")?.clone());
            }
            "--no-browser" if authorize => open_browser = false,
            other => anyhow::bail!("unrecognized argument: {other}"),
        }
    }

    let command = if authorize {
        Command::Authorize {
            tenant_id,
            open_browser,
        }
    } else {
        Command::Serve
    };
    Ok(Cli {
        config_path,
        command,
    })
}

/// CORS for browser clients: any origin, and the session header readable from
/// scripts. Preflight requests are answered here without reaching a handler.
fn cors_layer() -> CorsLayer {
    let session_header = axum::http::HeaderName::from_static(session::SESSION_HEADER);
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            session_header.clone(),
            axum::http::HeaderName::from_static("mcp-protocol-version"),
        ])
        .expose_headers([session_header])
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`, sweeps
/// idle sessions (throttled) at the start of every request, and wraps
/// everything in the CORS layer.
fn build_router(state: AppState, oauth: OAuthState, max_connections: usize) -> Router {
    let registry = state.registry.clone();
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(session_handler)
        .with_state(state)
        .merge(routes::router(oauth))
        .layer(axum_middleware::from_fn_with_state(
            registry,
            sweep_idle_sessions,
        ))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .layer(cors_layer())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    let config_path = Config::resolve_path(cli.config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        public_url = %config.server.public_url,
        upstream_url = %config.upstream.url,
        store_backend = ?config.store.backend,
        "configuration loaded"
    );

    let store = open_credential_store(&config).await?;

    match cli.command {
        Command::Serve => serve(config, store).await,
        Command::Authorize {
            tenant_id,
            open_browser,
        } => authorize(config, store, tenant_id, open_browser).await,
    }
}

/// Open the configured key-value backend and wrap it with token encryption.
async fn open_credential_store(config: &Config) -> Result<Arc<CredentialStore>> {
    let kv: Arc<dyn KvStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => {
            let path = config
                .store
                .path
                .clone()
                .context("store.path is required for the file backend")?;
            Arc::new(
                FileStore::load(path.clone())
                    .await
                    .with_context(|| format!("failed to open store file {}", path.display()))?,
            )
        }
    };

    let key = config
        .encryption
        .key
        .as_ref()
        .context("token encryption key is not configured")?;
    let cipher = CipherBox::from_hex_key(key.expose()).context("invalid token encryption key")?;

    info!(backend = kv.id(), "credential store ready");
    Ok(Arc::new(CredentialStore::new(kv, Arc::new(cipher))))
}

fn build_gateway(
    config: &Config,
    client: reqwest::Client,
    redirect_uri: String,
) -> Result<Arc<OAuthGateway>> {
    let client_secret = config
        .oauth
        .client_secret
        .clone()
        .context("OAuth client secret is not configured")?;

    let gateway = OAuthGateway::new(
        client,
        GatewayConfig {
            client_id: config.oauth.client_id.clone(),
            client_secret,
            redirect_uri,
            authorization_endpoint: config.oauth.authorization_endpoint.clone(),
            token_endpoint: config.oauth.token_endpoint.clone(),
        },
    )
    .context("invalid OAuth endpoint configuration")?;
    Ok(Arc::new(gateway))
}

async fn serve(config: Config, store: Arc<CredentialStore>) -> Result<()> {
    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    let client = reqwest::Client::new();
    let gateway = build_gateway(&config, client.clone(), config.redirect_uri())?;
    let broker = CredentialBroker::new(store.clone(), gateway.clone());

    let upstream = Upstream {
        client,
        url: config.upstream.url.clone(),
        timeout: Duration::from_secs(config.server.timeout_secs),
    };
    let registry = Arc::new(
        SessionRegistry::new(broker.clone(), move |scoped| {
            ApiSession::new(scoped, upstream.clone())
        })
        .with_timing(
            Duration::from_secs(config.sessions.idle_timeout_secs),
            Duration::from_secs(config.sessions.sweep_interval_secs),
        ),
    );

    let app_state = AppState {
        registry: registry.clone(),
        stats: Arc::new(GatewayStats::new()),
        prometheus: prometheus_handle,
        store_backend: store.backend().to_string(),
    };
    let oauth_state = OAuthState {
        store,
        server: gateway,
        broker,
        registry: registry.clone(),
    };

    let app = build_router(app_state, oauth_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown with drain timeout enforcement:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. DRAIN_TIMEOUT bounds the drain, starting at signal receipt
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    // Tear down every session handler once no request can reach them
    registry.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

/// Run one local authorization round trip and store the resulting credential.
async fn authorize(
    config: Config,
    store: Arc<CredentialStore>,
    tenant_id: Option<String>,
    open_browser: bool,
) -> Result<()> {
    if config.store.backend == StoreBackend::Memory {
        warn!("memory store configured, the credential will not outlive this process");
    }

    let tenant_id = tenant_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let gateway = build_gateway(
        &config,
        reqwest::Client::new(),
        config.interactive_redirect_uri(),
    )?;
    let broker = CredentialBroker::new(store, gateway.clone());

    let port = config.interactive.port;
    let mut channel = LoopbackChannel::bind(port)
        .await
        .with_context(|| format!("failed to bind loopback port {port}"))?;
    if !open_browser {
        channel = channel.without_browser();
    }

    let timeout = Duration::from_secs(config.interactive.timeout_secs);
    let tokens = broker_auth::authorize_interactive(gateway.as_ref(), &channel, timeout)
        .await
        .context("interactive authorization failed")?;
    drop(channel);

    broker
        .store_credential(
            &tenant_id,
            tokens.access_token,
            tokens.refresh_token,
            tokens.expires_in,
        )
        .await
        .context("failed to store credential")?;

    info!(tenant_id = %tenant_id, "interactive authorization complete");
    println!("{tenant_id}");
    Ok(())
}

/// Evict idle sessions before handling any request (throttled by the registry).
async fn sweep_idle_sessions(
    State(registry): State<Arc<SessionRegistry<ApiSession>>>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    registry.maybe_sweep(unix_now()).await;
    next.run(request).await
}

/// Health endpoint: status, uptime, requests served and active sessions.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.stats.started_at.elapsed().as_secs(),
        "requests_served": state.stats.requests_total.load(Ordering::Relaxed),
        "active_sessions": state.registry.len().await,
        "store_backend": state.store_backend,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler: route the request to its tenant's session handler.
async fn session_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);

    let tenant_id = session::session_id_or_new(request.headers());
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());

    let handler = state.registry.get_or_create(&tenant_id).await;
    let response = handler.forward(request, request_id).await;

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    session::attach(response, &tenant_id)
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
