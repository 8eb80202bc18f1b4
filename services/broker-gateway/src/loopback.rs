//! Loopback user-interaction channel for local authorization
//!
//! Binds `127.0.0.1:{port}` up front so the redirect URI is live before the
//! user opens the link. `await_callback` serves exactly one
//! `/oauth/callback` request and then shuts the listener down. Dropping the
//! future (timeout, Ctrl+C) drops the listener too, which releases the port.

use std::future::Future;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::get;
use broker_auth::{
    CALLBACK_PATH, CallbackParams, CallbackQuery, Error, InteractionFuture, Result,
    UserInteraction,
};
use tokio::net::TcpListener;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, warn};

type CallbackSlot = Arc<Mutex<Option<oneshot::Sender<Result<CallbackParams>>>>>;

/// System command that opens a URL in the default browser
#[cfg(target_os = "macos")]
const OPENER: (&str, &[&str]) = ("open", &[]);
#[cfg(target_os = "windows")]
const OPENER: (&str, &[&str]) = ("cmd", &["/C", "start", ""]);
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const OPENER: (&str, &[&str]) = ("xdg-open", &[]);

pub struct LoopbackChannel {
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    port: u16,
    open_browser: bool,
}

impl LoopbackChannel {
    /// Bind the loopback listener. Port 0 picks a free port.
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        info!(port, "loopback callback listener bound");
        Ok(Self {
            listener: tokio::sync::Mutex::new(Some(listener)),
            port,
            open_browser: true,
        })
    }

    /// Only print the link; never spawn a browser.
    pub fn without_browser(mut self) -> Self {
        self.open_browser = false;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn launch_browser(url: &str) -> bool {
        let (program, args) = OPENER;
        match std::process::Command::new(program).args(args).arg(url).spawn() {
            Ok(_) => {
                debug!(program, "browser launched");
                true
            }
            Err(e) => {
                debug!(program, error = %e, "browser launch failed");
                false
            }
        }
    }

    async fn serve_once(&self) -> Result<CallbackParams> {
        let listener = self.listener.lock().await.take().ok_or_else(|| {
            Error::Configuration("loopback listener already used for a callback".into())
        })?;

        let (tx, rx) = oneshot::channel();
        let slot: CallbackSlot = Arc::new(Mutex::new(Some(tx)));
        let done = Arc::new(Notify::new());

        let app = {
            let done = done.clone();
            Router::new().route(
                CALLBACK_PATH,
                get(move |Query(query): Query<CallbackQuery>| {
                    let slot = slot.clone();
                    let done = done.clone();
                    async move { handle_callback(query, &slot, &done) }
                }),
            )
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for(done))
            .await
            .map_err(|e| Error::Network(format!("loopback listener failed: {e}")))?;
        debug!("loopback listener closed");

        callback_outcome(rx.await)
    }
}

/// What the flow sees once the listener has stopped.
fn callback_outcome(
    received: std::result::Result<Result<CallbackParams>, oneshot::error::RecvError>,
) -> Result<CallbackParams> {
    received.map_err(|_| Error::Network("loopback listener closed without a callback".into()))?
}

fn wait_for(done: Arc<Notify>) -> impl Future<Output = ()> + Send + 'static {
    async move { done.notified().await }
}

/// Hand the first callback to the waiting flow and ask the server to stop.
fn handle_callback(
    query: CallbackQuery,
    slot: &CallbackSlot,
    done: &Notify,
) -> (StatusCode, &'static str) {
    let Some(tx) = slot.lock().ok().and_then(|mut s| s.take()) else {
        return (StatusCode::CONFLICT, "Authorization already handled.");
    };

    let result = query.into_params();
    let reply = match &result {
        Ok(_) => (
            StatusCode::OK,
            "Authorization received. You can close this window.",
        ),
        Err(e) => {
            warn!(error = %e, "authorization callback carried an error");
            (StatusCode::BAD_REQUEST, "Authorization failed. See the terminal for details.")
        }
    };

    let _ = tx.send(result);
    done.notify_one();
    reply
}

impl UserInteraction for LoopbackChannel {
    fn present_authorization_link<'a>(&'a self, url: &'a str) -> InteractionFuture<'a, ()> {
        Box::pin(async move {
            eprintln!("Open this URL in a browser to authorize:\n\n  {url}\n");
            if self.open_browser && !Self::launch_browser(url) {
                warn!("could not launch a browser, open the link manually");
            }
            Ok(())
        })
    }

    fn await_callback(&self) -> InteractionFuture<'_, CallbackParams> {
        Box::pin(self.serve_once())
    }
}
