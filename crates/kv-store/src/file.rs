//! Durable JSON-file store
//!
//! Keeps the whole key space in memory and rewrites the backing file on every
//! mutation. All writes use atomic temp-file + rename to prevent corruption on
//! crash, and a tokio Mutex serializes concurrent writers within the process.
//!
//! Expiry is recorded as an absolute unix timestamp in seconds so that TTLs
//! survive restarts. Expired entries are ignored on read and dropped from the
//! file on the next write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::{KvStore, StoreFuture};

/// A single persisted value with its absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    value: String,
    /// Expiration as unix timestamp in seconds
    expires_at: u64,
}

/// Key-value store persisted to a JSON file with 0600 permissions.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<HashMap<String, FileEntry>>,
}

impl FileStore {
    /// Load the store from `path`.
    ///
    /// If the file doesn't exist, creates it as `{}`. Entries that expired
    /// while the process was down are discarded during load.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
            let mut entries: HashMap<String, FileEntry> = serde_json::from_str(&contents)
                .map_err(|e| Error::Serialization(format!("parsing store file: {e}")))?;
            let now = unix_now();
            entries.retain(|_, e| e.expires_at > now);
            info!(path = %path.display(), entries = entries.len(), "loaded key-value store");
            entries
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Number of unexpired entries.
    pub async fn len(&self) -> usize {
        let now = unix_now();
        let state = self.state.lock().await;
        state.values().filter(|e| e.expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl KvStore for FileStore {
    fn id(&self) -> &str {
        "file"
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .get(key)
                .filter(|e| e.expires_at > unix_now())
                .map(|e| e.value.clone()))
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = unix_now();
            let mut state = self.state.lock().await;
            state.retain(|_, e| e.expires_at > now);
            state.insert(
                key.to_string(),
                FileEntry {
                    value,
                    expires_at: now.saturating_add(ttl.as_secs()),
                },
            );
            debug!(key, ttl_secs = ttl.as_secs(), "stored entry");
            write_atomic(&self.path, &state).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(key).is_some() {
                debug!(key, "deleted entry");
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Write entries to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file holds encrypted tokens and CSRF state.
async fn write_atomic(path: &Path, data: &HashMap<String, FileEntry>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Serialization(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".kv-store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store");
    Ok(())
}
