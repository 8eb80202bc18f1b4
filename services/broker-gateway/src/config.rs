//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The OAuth client secret and the token encryption key are loaded from
//! OAUTH_CLIENT_SECRET / TOKEN_ENCRYPTION_KEY or from files named in the
//! config, never stored in the TOML directly to avoid leaking secrets.

use broker_auth::{CALLBACK_PATH, INTERACTIVE_TIMEOUT_SECS, LOOPBACK_PORT};
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub interactive: InteractiveConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Externally reachable base URL; the OAuth redirect URI hangs off it
    pub public_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// OAuth client registration with the provider
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to OAUTH_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

/// Token-at-rest encryption settings
#[derive(Debug, Default, Deserialize)]
pub struct EncryptionConfig {
    /// Hex-encoded 256-bit key
    #[serde(skip)]
    pub key: Option<Secret<String>>,
    /// Path to a file containing the key (alternative to TOKEN_ENCRYPTION_KEY)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

/// The proxied third-party API
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

/// Credential and CSRF state persistence
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Session registry timings
#[derive(Debug, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Local interactive authorization (`authorize` subcommand)
#[derive(Debug, Deserialize)]
pub struct InteractiveConfig {
    #[serde(default = "default_loopback_port")]
    pub port: u16,
    #[serde(default = "default_interactive_timeout")]
    pub timeout_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for InteractiveConfig {
    fn default() -> Self {
        Self {
            port: default_loopback_port(),
            timeout_secs: default_interactive_timeout(),
        }
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_loopback_port() -> u16 {
    LOOPBACK_PORT
}

fn default_interactive_timeout() -> u64 {
    INTERACTIVE_TIMEOUT_SECS
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Secret resolution order (client secret and encryption key alike):
    /// 1. Env var
    /// 2. `*_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.oauth.client_secret =
            resolve_secret("OAUTH_CLIENT_SECRET", config.oauth.client_secret_file.as_deref())?;
        if config.oauth.client_secret.is_none() {
            return Err(common::Error::Config(
                "OAuth client secret missing: set OAUTH_CLIENT_SECRET or oauth.client_secret_file"
                    .into(),
            ));
        }

        config.encryption.key =
            resolve_secret("TOKEN_ENCRYPTION_KEY", config.encryption.key_file.as_deref())?;
        if config.encryption.key.is_none() {
            return Err(common::Error::Config(
                "encryption key missing: set TOKEN_ENCRYPTION_KEY or encryption.key_file".into(),
            ));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        for (name, url) in [
            ("server.public_url", &self.server.public_url),
            ("oauth.authorization_endpoint", &self.oauth.authorization_endpoint),
            ("oauth.token_endpoint", &self.oauth.token_endpoint),
            ("upstream.url", &self.upstream.url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        for (name, value) in [
            ("server.timeout_secs", self.server.timeout_secs),
            ("sessions.idle_timeout_secs", self.sessions.idle_timeout_secs),
            ("sessions.sweep_interval_secs", self.sessions.sweep_interval_secs),
            ("interactive.timeout_secs", self.interactive.timeout_secs),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.store.backend == StoreBackend::File && self.store.path.is_none() {
            return Err(common::Error::Config(
                "store.path is required when store.backend = \"file\"".into(),
            ));
        }

        Ok(())
    }

    /// Redirect URI registered for the web flow: `{public_url}/oauth/callback`.
    pub fn redirect_uri(&self) -> String {
        format!(
            "{}{CALLBACK_PATH}",
            self.server.public_url.trim_end_matches('/')
        )
    }

    /// Redirect URI for the local interactive flow.
    pub fn interactive_redirect_uri(&self) -> String {
        format!("http://localhost:{}{CALLBACK_PATH}", self.interactive.port)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("oauth-broker-gateway.toml")
    }
}

/// Read a secret from `env_var`, else from `file`. Empty values count as unset.
fn resolve_secret(env_var: &str, file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Ok(value) = std::env::var(env_var) {
        let value = value.trim().to_owned();
        if !value.is_empty() {
            return Ok(Some(Secret::new(value)));
        }
    }

    let Some(file) = file else {
        return Ok(None);
    };
    let value = std::fs::read_to_string(file).map_err(|e| {
        common::Error::Config(format!("failed to read {}: {e}", file.display()))
    })?;
    let value = value.trim().to_owned();
    Ok((!value.is_empty()).then(|| Secret::new(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    /// Write secret files plus a config referencing them; returns the config path.
    fn write_config(dir: &tempfile::TempDir, extra: &str) -> PathBuf {
        let secret_path = dir.path().join("client_secret");
        let key_path = dir.path().join("encryption_key");
        std::fs::write(&secret_path, "file-secret\n").unwrap();
        std::fs::write(&key_path, format!("{KEY_HEX}\n")).unwrap();

        let toml = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8080"
public_url = "https://gateway.example/"

[oauth]
client_id = "client-123"
authorization_endpoint = "https://provider.example/oauth/authorize"
token_endpoint = "https://provider.example/oauth/token"
client_secret_file = "{}"

[encryption]
key_file = "{}"

[upstream]
url = "https://api.provider.example/v1"
{extra}
"#,
            secret_path.display(),
            key_path.display()
        );
        let path = dir.path().join("config.toml");
        std::fs::write(&path, toml).unwrap();
        path
    }

    fn clear_env() {
        unsafe {
            remove_env("OAUTH_CLIENT_SECRET");
            remove_env("TOKEN_ENCRYPTION_KEY");
        }
    }

    #[test]
    fn load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();

        let config = Config::load(&write_config(&dir, "")).unwrap();
        assert_eq!(config.server.timeout_secs, 60);
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.sessions.idle_timeout_secs, 3600);
        assert_eq!(config.sessions.sweep_interval_secs, 300);
        assert_eq!(config.interactive.port, 3737);
        assert_eq!(config.interactive.timeout_secs, 300);
        assert_eq!(
            config.oauth.client_secret.as_ref().unwrap().expose(),
            "file-secret"
        );
        assert_eq!(config.encryption.key.as_ref().unwrap().expose(), KEY_HEX);
    }

    #[test]
    fn redirect_uris() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();

        let config = Config::load(&write_config(&dir, "")).unwrap();
        assert_eq!(config.redirect_uri(), "https://gateway.example/oauth/callback");
        assert_eq!(
            config.interactive_redirect_uri(),
            "http://localhost:3737/oauth/callback"
        );
    }

    #[test]
    fn env_secrets_take_precedence_over_files() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        unsafe {
            set_env("OAUTH_CLIENT_SECRET", "env-secret");
            set_env("TOKEN_ENCRYPTION_KEY", &"ab".repeat(32));
        }
        let config = Config::load(&path).unwrap();
        clear_env();

        assert_eq!(
            config.oauth.client_secret.as_ref().unwrap().expose(),
            "env-secret"
        );
        assert_eq!(
            config.encryption.key.as_ref().unwrap().expose(),
            &"ab".repeat(32)
        );
    }

    #[test]
    fn missing_encryption_key_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");
        std::fs::write(dir.path().join("encryption_key"), "  \n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("encryption key"), "got: {err}");
    }

    #[test]
    fn file_backend_requires_path() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();

        let path = write_config(&dir, "\n[store]\nbackend = \"file\"\n");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("store.path"), "got: {err}");

        let path = write_config(
            &dir,
            "\n[store]\nbackend = \"file\"\npath = \"/var/lib/broker/store.json\"\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.backend, StoreBackend::File);
    }

    #[test]
    fn zero_values_are_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();

        let path = write_config(&dir, "\n[sessions]\nidle_timeout_secs = 0\n");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("idle_timeout_secs"), "got: {err}");

        let path = write_config(&dir, "\n[interactive]\ntimeout_secs = 0\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn non_http_urls_are_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");
        let contents = std::fs::read_to_string(&path)
            .unwrap()
            .replace("https://api.provider.example/v1", "ftp://api.provider.example");
        std::fs::write(&path, contents).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("upstream.url"), "got: {err}");
    }

    #[test]
    fn missing_file_and_invalid_toml_fail() {
        assert!(Config::load(Path::new("/nonexistent/path/config.toml")).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid {{{{ toml").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn resolve_path_prefers_cli() {
        assert_eq!(
            Config::resolve_path(Some("/etc/broker.toml")),
            PathBuf::from("/etc/broker.toml")
        );
    }
}
