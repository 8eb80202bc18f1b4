//! Fixtures shared by the gateway's unit tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::StatusCode;
use broker_auth::{CipherBox, CredentialStore, GatewayConfig, OAuthGateway};
use broker_sessions::{CredentialBroker, SessionRegistry};
use common::Secret;
use kv_store::MemoryStore;
use tokio::net::TcpListener;

use crate::proxy::{ApiSession, Upstream};

pub const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// Token endpoint reply for a successful grant
pub const TOKENS: &str = r#"{"access_token":"at_1","refresh_token":"rt_1","expires_in":3600}"#;

pub fn credential_store() -> Arc<CredentialStore> {
    Arc::new(CredentialStore::new(
        Arc::new(MemoryStore::new()),
        Arc::new(CipherBox::from_hex_key(KEY_HEX).unwrap()),
    ))
}

pub fn gateway(token_url: &str) -> Arc<OAuthGateway> {
    Arc::new(
        OAuthGateway::new(
            reqwest::Client::new(),
            GatewayConfig {
                client_id: "client-123".into(),
                client_secret: Secret::new("shh".into()),
                redirect_uri: "https://gateway.example/oauth/callback".into(),
                authorization_endpoint: "https://provider.example/oauth/authorize".into(),
                token_endpoint: token_url.into(),
            },
        )
        .unwrap(),
    )
}

pub fn registry(broker: &CredentialBroker, upstream_url: &str) -> Arc<SessionRegistry<ApiSession>> {
    let upstream = Upstream {
        client: reqwest::Client::new(),
        url: upstream_url.to_string(),
        timeout: Duration::from_secs(5),
    };
    Arc::new(SessionRegistry::new(broker.clone(), move |scoped| {
        ApiSession::new(scoped, upstream.clone())
    }))
}

/// A mock token endpoint and the forms it has received.
pub struct TokenServer {
    pub url: String,
    forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl TokenServer {
    pub fn forms(&self) -> Vec<HashMap<String, String>> {
        self.forms.lock().unwrap().clone()
    }
}

/// Start a mock token endpoint answering every grant with `status` and `body`.
pub async fn start_token_server(status: StatusCode, body: &'static str) -> TokenServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let forms = Arc::new(Mutex::new(Vec::new()));

    let recorder = forms.clone();
    let app = axum::Router::new().route(
        "/token",
        axum::routing::post(
            move |axum::Form(form): axum::Form<HashMap<String, String>>| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(form);
                    (
                        status,
                        [(axum::http::header::CONTENT_TYPE, "application/json")],
                        body,
                    )
                }
            },
        ),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TokenServer {
        url: format!("http://{addr}/token"),
        forms,
    }
}

/// Start a mock upstream that echoes back request headers and body as JSON.
pub async fn start_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let app = axum::Router::new().fallback(|request: axum::http::Request<Body>| async move {
            let mut headers_map = serde_json::Map::new();
            for (name, value) in request.headers() {
                headers_map.insert(
                    name.to_string(),
                    serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                );
            }
            let method = request.method().to_string();
            let path = request.uri().path().to_string();
            let query = request.uri().query().unwrap_or("").to_string();
            let body_bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                .await
                .unwrap();
            let body = serde_json::json!({
                "echoed_headers": headers_map,
                "method": method,
                "path": path,
                "query": query,
                "body": String::from_utf8_lossy(&body_bytes),
            });
            (
                StatusCode::OK,
                [("x-upstream-echo", "true")],
                axum::Json(body),
            )
        });
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}
