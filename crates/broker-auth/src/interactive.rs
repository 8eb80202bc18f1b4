//! Interactive authorization for a single local user
//!
//! Drives one authorization-code round trip through a `UserInteraction`
//! channel: mint a state, present the authorization link, wait for the
//! provider to redirect back, check the state, then exchange the code. The
//! channel decides how the link is shown and how the redirect is received;
//! the gateway binary ships a loopback HTTP listener for this.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::csrf::{generate_state, states_match};
use crate::error::{Error, Result};
use crate::gateway::{AuthorizationServer, TokenResponse};

/// Raw query parameters of a provider redirect.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// A successful redirect: the authorization code and the echoed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

impl CallbackQuery {
    /// Validate the redirect. A provider-reported `error` wins over any code.
    pub fn into_params(self) -> Result<CallbackParams> {
        if let Some(error) = self.error {
            let reason = match self.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            };
            return Err(Error::AuthorizationDenied(reason));
        }

        let state = self
            .state
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Csrf("callback is missing the state parameter".into()))?;
        let code = self.code.filter(|c| !c.is_empty()).ok_or_else(|| {
            Error::AuthorizationDenied("callback carried no authorization code".into())
        })?;

        Ok(CallbackParams { code, state })
    }
}

/// Boxed future returned by `UserInteraction` methods.
pub type InteractionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// How the user is shown the authorization link and how the redirect comes
/// back.
pub trait UserInteraction: Send + Sync {
    /// Show the user where to authorize (open a browser, print a link).
    fn present_authorization_link<'a>(&'a self, url: &'a str) -> InteractionFuture<'a, ()>;

    /// Resolve with the first redirect the provider sends back.
    fn await_callback(&self) -> InteractionFuture<'_, CallbackParams>;
}

/// Run one interactive authorization and return the provider's tokens.
///
/// Fails with `Error::Timeout` when no redirect arrives within `timeout` and
/// with `Error::Csrf` when the echoed state differs from the one issued. The
/// caller persists the returned tokens.
pub async fn authorize_interactive(
    server: &dyn AuthorizationServer,
    channel: &dyn UserInteraction,
    timeout: Duration,
) -> Result<TokenResponse> {
    let state = generate_state();
    let url = server.authorization_url(&state);
    channel.present_authorization_link(&url).await?;
    info!(timeout_secs = timeout.as_secs(), "waiting for authorization callback");

    let callback = tokio::time::timeout(timeout, channel.await_callback())
        .await
        .map_err(|_| Error::Timeout {
            secs: timeout.as_secs(),
        })??;

    if !states_match(&state, &callback.state) {
        warn!("authorization callback carried an unexpected state");
        return Err(Error::Csrf("state does not match the issued value".into()));
    }

    server.exchange_code(&callback.code).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GrantFuture;
    use std::sync::Mutex;

    /// Authorization server that hands out tokens without any network.
    #[derive(Default)]
    struct FakeServer {
        exchanged: Mutex<Vec<String>>,
    }

    impl AuthorizationServer for FakeServer {
        fn authorization_url(&self, state: &str) -> String {
            format!("https://provider.example/authorize?state={state}")
        }

        fn exchange_code<'a>(&'a self, code: &'a str) -> GrantFuture<'a> {
            self.exchanged.lock().unwrap().push(code.to_string());
            Box::pin(async move {
                Ok(TokenResponse {
                    access_token: format!("access-for-{code}"),
                    refresh_token: Some("refresh".into()),
                    expires_in: Some(3600),
                })
            })
        }

        fn refresh<'a>(&'a self, _refresh_token: &'a str) -> GrantFuture<'a> {
            Box::pin(async { Err(Error::Network("not used".into())) })
        }
    }

    enum Reply {
        /// Echo the issued state back with this code
        Echo(&'static str),
        /// Answer with a state the flow never issued
        Forged,
        /// Provider redirected with an error
        Denied,
        /// Nobody ever comes back
        Never,
    }

    struct ScriptedChannel {
        reply: Reply,
        presented: Mutex<Option<String>>,
    }

    impl ScriptedChannel {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                presented: Mutex::new(None),
            }
        }

        fn issued_state(&self) -> String {
            let url = self.presented.lock().unwrap().clone().unwrap_or_default();
            url.split_once("state=")
                .map(|(_, s)| s.to_string())
                .unwrap_or_default()
        }
    }

    impl UserInteraction for ScriptedChannel {
        fn present_authorization_link<'a>(&'a self, url: &'a str) -> InteractionFuture<'a, ()> {
            *self.presented.lock().unwrap() = Some(url.to_string());
            Box::pin(async { Ok(()) })
        }

        fn await_callback(&self) -> InteractionFuture<'_, CallbackParams> {
            Box::pin(async move {
                match self.reply {
                    Reply::Echo(code) => Ok(CallbackParams {
                        code: code.into(),
                        state: self.issued_state(),
                    }),
                    Reply::Forged => Ok(CallbackParams {
                        code: "c".into(),
                        state: "forged".into(),
                    }),
                    Reply::Denied => CallbackQuery {
                        error: Some("access_denied".into()),
                        ..Default::default()
                    }
                    .into_params(),
                    Reply::Never => std::future::pending().await,
                }
            })
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn completes_when_state_is_echoed() {
        let server = FakeServer::default();
        let channel = ScriptedChannel::new(Reply::Echo("code-1"));

        let tokens = authorize_interactive(&server, &channel, TIMEOUT).await.unwrap();
        assert_eq!(tokens.access_token, "access-for-code-1");
        assert_eq!(*server.exchanged.lock().unwrap(), vec!["code-1".to_string()]);
        assert_eq!(channel.issued_state().len(), 43);
    }

    #[tokio::test]
    async fn forged_state_is_rejected_without_exchange() {
        let server = FakeServer::default();
        let channel = ScriptedChannel::new(Reply::Forged);

        let result = authorize_interactive(&server, &channel, TIMEOUT).await;
        assert!(matches!(result, Err(Error::Csrf(_))));
        assert!(server.exchanged.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_denial_propagates() {
        let server = FakeServer::default();
        let channel = ScriptedChannel::new(Reply::Denied);

        let result = authorize_interactive(&server, &channel, TIMEOUT).await;
        assert!(matches!(result, Err(Error::AuthorizationDenied(ref m)) if m == "access_denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_channel_times_out() {
        let server = FakeServer::default();
        let channel = ScriptedChannel::new(Reply::Never);

        let result = authorize_interactive(&server, &channel, TIMEOUT).await;
        assert!(matches!(result, Err(Error::Timeout { secs: 300 })));
        assert!(server.exchanged.lock().unwrap().is_empty());
    }

    #[test]
    fn callback_query_validation() {
        let ok = CallbackQuery {
            code: Some("c".into()),
            state: Some("s".into()),
            ..Default::default()
        };
        assert_eq!(
            ok.into_params().unwrap(),
            CallbackParams {
                code: "c".into(),
                state: "s".into()
            }
        );

        let denied = CallbackQuery {
            code: Some("c".into()),
            state: Some("s".into()),
            error: Some("access_denied".into()),
            error_description: Some("user said no".into()),
        };
        match denied.into_params() {
            Err(Error::AuthorizationDenied(m)) => assert_eq!(m, "access_denied: user said no"),
            other => panic!("expected denial, got {other:?}"),
        }

        let no_state = CallbackQuery {
            code: Some("c".into()),
            ..Default::default()
        };
        assert!(matches!(no_state.into_params(), Err(Error::Csrf(_))));

        let no_code = CallbackQuery {
            state: Some("s".into()),
            ..Default::default()
        };
        assert!(matches!(
            no_code.into_params(),
            Err(Error::AuthorizationDenied(_))
        ));
    }
}
